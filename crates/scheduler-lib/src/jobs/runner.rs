use crate::compute::{ComputeProvider, ProviderError, ProviderFactory};
use crate::models::{JobKind, PowerState, RunOutcome, RunSummary, VmDescriptor};
use crate::observability::{SkipReason, StructuredLogger};
use crate::settings::{JobSettings, SettingsError};
use crate::timer::TimerTrigger;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// What happened to a single VM during a run
#[derive(Debug)]
pub enum VmOutcome {
    Skipped(SkipReason),
    Transitioned,
    Failed(ProviderError),
}

/// One of the two scheduled power jobs
pub struct PowerJob {
    kind: JobKind,
    factory: Arc<dyn ProviderFactory>,
    logger: StructuredLogger,
}

impl PowerJob {
    pub fn new(kind: JobKind, factory: Arc<dyn ProviderFactory>, logger: StructuredLogger) -> Self {
        Self {
            kind,
            factory,
            logger,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Handle a timer firing, reading settings from the process environment
    pub async fn invoke(&self, trigger: &TimerTrigger) -> Result<RunOutcome> {
        self.invoke_with(trigger, JobSettings::from_env(self.kind))
            .await
    }

    /// Handle a timer firing with already-resolved settings
    pub async fn invoke_with(
        &self,
        trigger: &TimerTrigger,
        settings: Result<JobSettings, SettingsError>,
    ) -> Result<RunOutcome> {
        if trigger.past_due {
            self.logger
                .log_past_due(self.kind, trigger.lateness().num_seconds());
        }
        self.logger
            .log_job_started(self.kind, &trigger.scheduled_at.to_rfc3339());

        let settings = match settings {
            Ok(settings) => settings,
            Err(SettingsError::Missing(missing)) => {
                self.logger.log_run_aborted(self.kind, &missing);
                return Ok(RunOutcome::Aborted { missing });
            }
            Err(err) => {
                let err = anyhow::Error::new(err).context("Failed to resolve job settings");
                self.logger.log_run_failed(self.kind, &err);
                return Err(err);
            }
        };

        match self.run(&settings).await {
            Ok(summary) => Ok(RunOutcome::Completed(summary)),
            Err(err) => {
                self.logger.log_run_failed(self.kind, &err);
                Err(err)
            }
        }
    }

    /// Connect to the provider and process every VM of the target group
    pub async fn run(&self, settings: &JobSettings) -> Result<RunSummary> {
        let started = Instant::now();
        let provider = self
            .factory
            .connect(&settings.target)
            .context("Failed to create compute client")?;

        self.process_all(settings, provider.as_ref(), started).await
    }

    /// Elapsed time in the summary is measured from `started`
    async fn process_all(
        &self,
        settings: &JobSettings,
        provider: &dyn ComputeProvider,
        started: Instant,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::new(self.kind);

        let vms = provider.list_vms().await.with_context(|| {
            format!(
                "Failed to list virtual machines in resource group {}",
                settings.target.resource_group
            )
        })?;
        self.logger
            .log_enumerated(self.kind, &settings.target.resource_group, vms.len());

        let mut seen = HashSet::new();
        for vm in &vms {
            if !seen.insert(vm.name.as_str()) {
                self.logger.log_vm_skipped(
                    self.kind,
                    &vm.name,
                    SkipReason::Duplicate,
                    "listed more than once",
                );
                summary.skipped += 1;
                continue;
            }

            match self.process_vm(settings, provider, vm).await {
                VmOutcome::Skipped(_) => summary.skipped += 1,
                VmOutcome::Transitioned => summary.transitioned += 1,
                VmOutcome::Failed(err) => {
                    self.logger
                        .log_vm_error(self.kind, &vm.name, &err, err.is_transient());
                    summary.errored += 1;
                }
            }
        }

        summary.elapsed = started.elapsed();
        self.logger.log_summary(&summary);
        Ok(summary)
    }

    /// Classify one VM and apply the transition if it is eligible
    pub async fn process_vm(
        &self,
        settings: &JobSettings,
        provider: &dyn ComputeProvider,
        vm: &VmDescriptor,
    ) -> VmOutcome {
        // Exclusion wins over everything else
        if settings.is_excluded(vm) {
            return self.skip(vm, SkipReason::Excluded, "in the exclusion list");
        }

        if !settings.tag_matches(vm) {
            let detail = settings
                .tag_filter
                .as_ref()
                .map(|filter| format!("missing required tag {}", filter))
                .unwrap_or_default();
            return self.skip(vm, SkipReason::TagMismatch, &detail);
        }

        let state = match provider.power_state(&vm.name).await {
            Ok(state) => state,
            Err(err) => return VmOutcome::Failed(err),
        };

        if self.kind.is_satisfied_by(&state) {
            let detail = format!("current state: {}", state);
            return self.skip(vm, SkipReason::AlreadyInTargetState, &detail);
        }

        match self.transition(provider, &vm.name, &state).await {
            Ok(()) => {
                self.logger.log_transitioned(self.kind, &vm.name);
                VmOutcome::Transitioned
            }
            Err(err) => VmOutcome::Failed(err),
        }
    }

    async fn transition(
        &self,
        provider: &dyn ComputeProvider,
        vm_name: &str,
        state: &PowerState,
    ) -> Result<(), ProviderError> {
        self.logger
            .log_transition_requested(self.kind, vm_name, state);

        match self.kind {
            JobKind::Deallocate => provider.deallocate(vm_name).await,
            JobKind::Start => provider.start(vm_name).await,
        }
    }

    fn skip(&self, vm: &VmDescriptor, reason: SkipReason, detail: &str) -> VmOutcome {
        self.logger.log_vm_skipped(self.kind, &vm.name, reason, detail);
        VmOutcome::Skipped(reason)
    }
}
