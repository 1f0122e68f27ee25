//! Routes dequeued jobs to the pipeline and the cascade fetcher

use crate::services::cascade::CascadeFetcher;
use crate::services::job_queue::{Job, JobHandler};
use crate::services::pipeline::AnalysisPipeline;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct JobDispatcher {
    pipeline: Arc<AnalysisPipeline>,
    cascade: Arc<CascadeFetcher>,
}

impl JobDispatcher {
    pub fn new(pipeline: Arc<AnalysisPipeline>, cascade: Arc<CascadeFetcher>) -> Self {
        Self { pipeline, cascade }
    }
}

#[async_trait]
impl JobHandler for JobDispatcher {
    async fn handle(&self, job: Job, cancel: CancellationToken) {
        match job {
            Job::SubmitAnalysis(id) => self.pipeline.submit(id, &cancel).await,
            Job::FetchAnalysisResult(id) => self.pipeline.fetch_result(id, &cancel).await,
            Job::RunCascade(id) => self.cascade.run(id, &cancel).await,
        }
    }
}
