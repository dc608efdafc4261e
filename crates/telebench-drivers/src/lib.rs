//! Built-in protocol drivers for telebench.
//!
//! - **loopback** — in-process active driver with optional simulated impairment
//! - **udp** — active driver over real UDP sockets, JSON datagrams and acks
//! - **exec** — passive driver running external binaries, harvested from a receive log

pub mod exec;
pub mod loopback;
pub mod udp;

use telebench_core::{DriverRegistry, ProtocolDriver};

pub use exec::ExecDriver;
pub use loopback::{LoopbackConfig, LoopbackDriver};
pub use udp::UdpDriver;

/// Registry holding every built-in driver under its protocol name.
pub fn builtin_registry() -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    registry.register("loopback", |cfg| {
        Ok(Box::new(LoopbackDriver::from_config(cfg)?) as Box<dyn ProtocolDriver>)
    });
    registry.register("udp", |cfg| {
        Ok(Box::new(UdpDriver::from_config(cfg)?) as Box<dyn ProtocolDriver>)
    });
    registry.register("exec", |cfg| {
        Ok(Box::new(ExecDriver::from_config(cfg)?) as Box<dyn ProtocolDriver>)
    });
    registry
}
