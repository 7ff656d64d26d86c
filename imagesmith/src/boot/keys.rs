//! Keys the injector can send to a guest console.

use serde::{Deserialize, Serialize};

/// A non-printable key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum SpecialKey {
    Enter,
    Tab,
    Esc,
    Backspace,
    Delete,
    Spacebar,
    Insert,
    Home,
    End,
    PageUp,
    PageDown,
    Up,
    Down,
    Left,
    Right,
    F1,
    F2,
    F3,
    F4,
    F5,
    F6,
    F7,
    F8,
    F9,
    F10,
    F11,
    F12,
}

/// A modifier key that is held down until released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Modifier {
    LeftAlt,
    LeftCtrl,
    LeftShift,
    RightAlt,
    RightCtrl,
    RightShift,
}

/// One console input event, as handed to the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum KeyInput {
    /// Printable text, typed character by character.
    Text(String),
    /// A single special key press.
    Key(SpecialKey),
    /// Press and hold a modifier.
    ModifierDown(Modifier),
    /// Release a held modifier.
    ModifierUp(Modifier),
}

/// What a `<name>` token stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NamedKey {
    Key(SpecialKey),
    Down(Modifier),
    Up(Modifier),
}

/// Looks up a key name, case-insensitively.
pub(crate) fn lookup(name: &str) -> Option<NamedKey> {
    use SpecialKey as K;

    let lower = name.to_ascii_lowercase();
    let key = match lower.as_str() {
        "enter" | "return" => K::Enter,
        "tab" => K::Tab,
        "esc" => K::Esc,
        "bs" => K::Backspace,
        "del" => K::Delete,
        "spacebar" => K::Spacebar,
        "insert" => K::Insert,
        "home" => K::Home,
        "end" => K::End,
        "pageup" => K::PageUp,
        "pagedown" => K::PageDown,
        "up" => K::Up,
        "down" => K::Down,
        "left" => K::Left,
        "right" => K::Right,
        "f1" => K::F1,
        "f2" => K::F2,
        "f3" => K::F3,
        "f4" => K::F4,
        "f5" => K::F5,
        "f6" => K::F6,
        "f7" => K::F7,
        "f8" => K::F8,
        "f9" => K::F9,
        "f10" => K::F10,
        "f11" => K::F11,
        "f12" => K::F12,
        _ => return modifier(&lower),
    };
    Some(NamedKey::Key(key))
}

fn modifier(lower: &str) -> Option<NamedKey> {
    let (side, rest) = if let Some(rest) = lower.strip_prefix("left") {
        (true, rest)
    } else {
        (false, lower.strip_prefix("right")?)
    };
    let (name, on) = if let Some(name) = rest.strip_suffix("on") {
        (name, true)
    } else {
        (rest.strip_suffix("off")?, false)
    };
    let m = match (side, name) {
        (true, "alt") => Modifier::LeftAlt,
        (true, "ctrl") => Modifier::LeftCtrl,
        (true, "shift") => Modifier::LeftShift,
        (false, "alt") => Modifier::RightAlt,
        (false, "ctrl") => Modifier::RightCtrl,
        (false, "shift") => Modifier::RightShift,
        _ => return None,
    };
    Some(if on { NamedKey::Down(m) } else { NamedKey::Up(m) })
}
