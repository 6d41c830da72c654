// Declare the modules that form the library's structure
pub mod cache;
pub mod config;
pub mod filter;
pub mod hook;
pub mod netlink;
pub mod types;
pub mod watch;

// Publicly export key types needed by the binary or tests
pub use cache::AddrCache;
pub use config::{load_env_file, validate_config, WatchConfig};
pub use filter::{parse_filters, passes, Filter, FilterExpr};
pub use hook::{parse_hook, EchoHook, ExecutableHook, Hook, HookError};
pub use types::{AddressEvent, InterfaceRef, Result, WatchError};
pub use watch::Watcher;
