//! Services: third-party clients, the job queue and the work it runs

pub mod acrcloud_client;
pub mod cascade;
pub mod dispatcher;
pub mod job_queue;
pub mod pipeline;
pub mod soundcharts_client;

pub use acrcloud_client::{
    AcrCloudClient, AcrCloudError, AcrCloudSettings, FingerprintService, UnconfiguredFingerprint,
};
pub use cascade::{CascadeFetcher, CascadeSettings};
pub use dispatcher::JobDispatcher;
pub use job_queue::{Job, JobHandler, JobQueue, JobQueueError, JobWorker};
pub use pipeline::{AnalysisPipeline, PipelineSettings, UploadOutcome, WebhookAck};
pub use soundcharts_client::{
    ChartDataSource, SoundchartsClient, SoundchartsError, SoundchartsSettings,
    UnconfiguredChartSource,
};
