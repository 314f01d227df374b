//! Save operations per tab: configuration, the state machine and the
//! async service that runs captures and hands results to packaging.

pub mod config;
pub mod filename;
pub mod machine;
pub mod service;

pub use config::DEFAULT_CONFIG_FILE;
pub use config::LogFormat;
pub use config::LoggingConfig;
pub use config::SaveConfig;
pub use filename::FileNameRules;
pub use filename::resource_file_name;
pub use filename::suggest_file_name;
pub use machine::ALREADY_IN_PROGRESS;
pub use machine::MachineInput;
pub use machine::SaveOperationState;
pub use machine::SaveStateMachine;
pub use pk_ipc::SavePhase;
pub use service::PackageJob;
pub use service::Packager;
pub use service::PagePlatform;
pub use service::SaveService;
