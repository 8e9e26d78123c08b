//! Core data model.
//!
//! Tasks link a caller to an expert within a project. Callers carry an
//! allocation status that decides whether they may receive work. Call
//! records, ledger entries, performance snapshots, and dead letters are the
//! durable trail left by the engine.

/// Status enums are stored as their SCREAMING_SNAKE_CASE names.
macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::error::Error;

            fn from_str(s: &str) -> crate::error::Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(crate::error::Error::Other(format!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

pub(crate) use status_enum;

pub mod call;
pub mod caller;
pub mod dead_letter;
pub mod job;
pub mod ledger;
pub mod performance;
pub mod task;

pub use call::*;
pub use caller::*;
pub use dead_letter::*;
pub use job::*;
pub use ledger::*;
pub use performance::*;
pub use task::*;
