//! 工具层：Tool 契约、注册表（并行构造）、执行器（超时与审计日志）与内置工具

pub mod executor;
pub mod location;
pub mod python;
pub mod registry;

pub use executor::ToolExecutor;
pub use location::{ConfiguredLocation, DeviceLocation, LocationService, LocationTool, LOCATION_TOOL};
pub use python::{PythonExecutorTool, PYTHON_EXECUTOR_TOOL};
pub use registry::{ReadyTool, Tool, ToolContext, ToolDescriptor, ToolProvider, ToolRegistry};
