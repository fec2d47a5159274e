//! Method dispatch: identity, call context, registry and the gateway itself.

pub mod context;
pub mod fault;
pub mod gateway;
pub mod registry;
pub mod system;

pub use context::{Call, Identity, Params};
pub use fault::{codes, fault_value, is_fault};
pub use gateway::{Gateway, GatewayResponse, Reply, STATUS_INTERNAL_ERROR, STATUS_OK};
pub use registry::{
    Handler, HandlerEntry, ModuleHandlers, Override, Registry, RegistryBuilder, DEFAULT_PRIORITY,
};
pub use system::system_module;
