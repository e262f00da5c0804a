//! entrain-services: Devices, analysis, persistence and session control

pub mod allocator;
pub mod analysis;
pub mod audio_input;
pub mod audio_io;
pub mod capture;
pub mod controller;
pub mod store;

pub use allocator::{AllocationError, Allocator};
pub use analysis::{AnalysisBridge, AnalysisCollaborator, AnalysisError, CollaboratorInput, OnsetAnalyzer, TrialAnalysis};
pub use audio_input::AudioInputService;
pub use audio_io::{AudioIoError, DeviceConfig, DevicePair, DuplexDevice, DuplexRecording};
pub use capture::{CaptureCoordinator, CaptureError, ChannelMap, RawCapture};
pub use controller::{
    ExperimentController, OperatorCommand, Prompt, SessionConfig, SessionError, SessionEvent, SessionHandle,
    SessionReport, TrialError,
};
pub use store::{OutputStore, StoreError};
