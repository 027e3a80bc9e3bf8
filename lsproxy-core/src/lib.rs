pub mod config;
pub mod control;
pub mod framing;
pub mod pending;
pub mod protocol;
pub mod relay;
pub mod supervisor;

pub use config::{get_config_path, load_config, Config};
pub use pending::RequestOutcome;
pub use relay::{
    spawn_passthrough, spawn_relay, Intercepted, RelayEvents, RelayHandle, RelayOptions,
    RelayStreams,
};
pub use supervisor::Supervisor;
