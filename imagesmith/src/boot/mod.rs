//! Boot injection: the boot command language and the console injector.

mod injector;
mod keys;
mod sequence;

pub use injector::{BootInjectionPolicy, BootInjector, InjectError};
pub use keys::{KeyInput, Modifier, SpecialKey};
pub use sequence::{BootKey, BootParseError, BootSequence, BootStep, ResolvedBootSequence};
