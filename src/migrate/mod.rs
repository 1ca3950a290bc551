//! Multi-step migration between two key-value backends: declarative plans
//! with copy/move/transform/validate/cleanup steps, per-record filters,
//! dry-run execution and rollback on failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::backup::BackupEngine;
use crate::error::{Error, Result};
use crate::repo::DataStore;

fn default_batch_size() -> usize {
    500
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default)]
    pub dry_run: bool,
    /// Snapshot the source with the backup engine before the first step.
    #[serde(default)]
    pub backup_before: bool,
    /// Archive path for `backup_before`; a generated path in the system
    /// temp directory when absent.
    #[serde(default)]
    pub backup_path: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        MigrationConfig {
            dry_run: false,
            backup_before: false,
            backup_path: None,
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Copy,
    Move,
    Transform,
    Validate,
    Cleanup,
}

/// Per-record predicate. Recognized types are `key_pattern` (exact match),
/// `key_prefix`, and `value_size` with `condition` `max_size`/`min_size`;
/// unknown types accept everything.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepFilter {
    #[serde(rename = "type")]
    pub filter_type: String,
    #[serde(default)]
    pub condition: Option<String>,
    pub value: String,
}

impl StepFilter {
    fn keeps(&self, key: &str, value: &[u8]) -> bool {
        match self.filter_type.as_str() {
            "key_pattern" => key == self.value,
            "key_prefix" => key.starts_with(&self.value),
            "value_size" => {
                let limit = match self.value.parse::<usize>() {
                    Ok(limit) => limit,
                    Err(_) => return true,
                };
                match self.condition.as_deref() {
                    Some("max_size") => value.len() <= limit,
                    Some("min_size") => value.len() >= limit,
                    _ => true,
                }
            }
            _ => true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyTransform {
    Identity,
    AddPrefix { prefix: String },
    StripPrefix { prefix: String },
    ReplacePrefix { from: String, to: String },
}

impl KeyTransform {
    fn apply(&self, key: &str) -> String {
        match self {
            KeyTransform::Identity => key.to_string(),
            KeyTransform::AddPrefix { prefix } => format!("{prefix}{key}"),
            KeyTransform::StripPrefix { prefix } => {
                key.strip_prefix(prefix.as_str()).unwrap_or(key).to_string()
            }
            KeyTransform::ReplacePrefix { from, to } => match key.strip_prefix(from.as_str()) {
                Some(rest) => format!("{to}{rest}"),
                None => key.to_string(),
            },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueTransform {
    Identity,
    Base64Encode,
    Base64Decode,
}

impl ValueTransform {
    fn apply(&self, value: Vec<u8>) -> Result<Vec<u8>> {
        let engine = base64::engine::general_purpose::STANDARD;
        match self {
            ValueTransform::Identity => Ok(value),
            ValueTransform::Base64Encode => Ok(engine.encode(value).into_bytes()),
            ValueTransform::Base64Decode => engine
                .decode(value)
                .map_err(|e| Error::ValidationFailed(format!("value is not base64: {e}"))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigrationStep {
    pub id: String,
    pub kind: StepKind,
    #[serde(default)]
    pub filters: Vec<StepFilter>,
    #[serde(default)]
    pub key_transform: Option<KeyTransform>,
    #[serde(default)]
    pub value_transform: Option<ValueTransform>,
    /// Exact key renames applied before the key transform.
    #[serde(default)]
    pub mappings: Option<HashMap<String, String>>,
}

impl MigrationStep {
    fn keeps(&self, key: &str, value: &[u8]) -> bool {
        self.filters.iter().all(|f| f.keeps(key, value))
    }

    fn destination_key(&self, key: &str) -> String {
        let mapped = self
            .mappings
            .as_ref()
            .and_then(|m| m.get(key).cloned())
            .unwrap_or_else(|| key.to_string());
        match &self.key_transform {
            Some(t) => t.apply(&mapped),
            None => mapped,
        }
    }

    fn destination_value(&self, value: Vec<u8>) -> Result<Vec<u8>> {
        match &self.value_transform {
            Some(t) => t.apply(value),
            None => Ok(value),
        }
    }
}

/// Immutable migration plan; matches the JSON plan document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<MigrationStep>,
    #[serde(default)]
    pub rollback_steps: Vec<MigrationStep>,
    #[serde(default)]
    pub config: MigrationConfig,
}

impl MigrationPlan {
    pub fn from_json(doc: &str) -> Result<Self> {
        Ok(serde_json::from_str(doc)?)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StepResult {
    pub step_id: String,
    pub kind: StepKind,
    pub success: bool,
    pub record_count: u64,
    pub byte_count: u64,
    pub error_count: u64,
    pub skipped_count: u64,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct MigrationResult {
    pub plan_id: String,
    pub success: bool,
    pub step_results: Vec<StepResult>,
    pub errors: Vec<String>,
    pub total_records: u64,
    pub migrated_records: u64,
    pub failed_records: u64,
    pub skipped_records: u64,
    pub success_rate: f64,
}

#[derive(Clone, Debug, Default)]
pub struct MigrationEngine {
    backup: BackupEngine,
}

impl MigrationEngine {
    pub fn new(backup: BackupEngine) -> Self {
        MigrationEngine { backup }
    }

    /// Runs `plan` from `src` into `dst`. Steps execute strictly in order; a
    /// failing step records its error, triggers the rollback steps (unless
    /// dry-running) and stops the run.
    pub async fn execute(
        &self,
        ctx: &CancellationToken,
        plan: &MigrationPlan,
        src: &Arc<dyn DataStore>,
        dst: &Arc<dyn DataStore>,
    ) -> Result<MigrationResult> {
        let dry_run = plan.config.dry_run;

        if plan.config.backup_before && !dry_run {
            let path = plan.config.backup_path.clone().unwrap_or_else(|| {
                std::env::temp_dir().join(format!(
                    "migration-{}-{}.tar.gz",
                    plan.id,
                    Utc::now().timestamp()
                ))
            });
            info!("pre-migration backup of source to {}", path.display());
            self.backup.create_backup(ctx, src, &path).await?;
        }

        let mut result = MigrationResult {
            plan_id: plan.id.clone(),
            success: true,
            step_results: Vec::with_capacity(plan.steps.len()),
            errors: Vec::new(),
            total_records: 0,
            migrated_records: 0,
            failed_records: 0,
            skipped_records: 0,
            success_rate: 0.0,
        };

        for step in &plan.steps {
            let outcome = self.run_step(ctx, step, src, dst, &plan.config).await;

            match outcome {
                Ok(step_result) => {
                    let ok = step_result.success;
                    if !ok {
                        result.errors.push(format!(
                            "step {} failed with {} errors",
                            step.id, step_result.error_count
                        ));
                    }
                    result.step_results.push(step_result);
                    if !ok {
                        result.success = false;
                        if !dry_run {
                            self.rollback(ctx, plan, src, dst).await;
                        }
                        break;
                    }
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    result.errors.push(format!("step {}: {e}", step.id));
                    result.success = false;
                    if !dry_run {
                        self.rollback(ctx, plan, src, dst).await;
                    }
                    break;
                }
            }
        }

        for step in &result.step_results {
            if matches!(step.kind, StepKind::Copy | StepKind::Move | StepKind::Transform) {
                result.total_records += step.record_count + step.error_count + step.skipped_count;
                result.migrated_records += step.record_count;
                result.failed_records += step.error_count;
                result.skipped_records += step.skipped_count;
            }
        }
        result.success_rate = if result.total_records > 0 {
            result.migrated_records as f64 / result.total_records as f64
        } else {
            0.0
        };

        Ok(result)
    }

    async fn rollback(
        &self,
        ctx: &CancellationToken,
        plan: &MigrationPlan,
        src: &Arc<dyn DataStore>,
        dst: &Arc<dyn DataStore>,
    ) {
        for step in &plan.rollback_steps {
            // a failing rollback step is logged and the rest still run
            match self.run_step(ctx, step, src, dst, &plan.config).await {
                Ok(step_result) if step_result.success => {}
                Ok(step_result) => warn!(
                    "rollback step {} finished with {} errors",
                    step.id, step_result.error_count
                ),
                Err(e) => warn!("rollback step {} failed: {e}", step.id),
            }
        }
    }

    async fn run_step(
        &self,
        ctx: &CancellationToken,
        step: &MigrationStep,
        src: &Arc<dyn DataStore>,
        dst: &Arc<dyn DataStore>,
        config: &MigrationConfig,
    ) -> Result<StepResult> {
        debug!("running migration step {} ({:?})", step.id, step.kind);
        match step.kind {
            StepKind::Copy | StepKind::Transform => {
                self.copy_records(ctx, step, src, dst, config, false).await
            }
            StepKind::Move => self.copy_records(ctx, step, src, dst, config, true).await,
            StepKind::Validate => self.validate_records(ctx, step, src, dst).await,
            StepKind::Cleanup => self.cleanup_records(ctx, step, dst, config).await,
        }
    }

    async fn copy_records(
        &self,
        ctx: &CancellationToken,
        step: &MigrationStep,
        src: &Arc<dyn DataStore>,
        dst: &Arc<dyn DataStore>,
        config: &MigrationConfig,
        delete_source: bool,
    ) -> Result<StepResult> {
        let started = Instant::now();
        let mut result = new_step_result(step);
        let mut copied = Vec::new();
        let mut batch: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(config.batch_size);

        let mut entries = src.scan(&[]).await;
        while let Some(record) = entries.next().await {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let (key_bytes, value) = record?;
            let key = match String::from_utf8(key_bytes.clone()) {
                Ok(key) => key,
                Err(_) => {
                    result.error_count += 1;
                    continue;
                }
            };

            if !step.keeps(&key, &value) {
                result.skipped_count += 1;
                continue;
            }

            let dest_key = step.destination_key(&key);
            let dest_value = match step.destination_value(value) {
                Ok(value) => value,
                Err(e) => {
                    warn!("step {}: record {key:?}: {e}", step.id);
                    result.error_count += 1;
                    continue;
                }
            };

            result.record_count += 1;
            result.byte_count += dest_value.len() as u64;
            batch.push((dest_key.into_bytes(), dest_value));
            if delete_source {
                copied.push(key_bytes);
            }

            if batch.len() >= config.batch_size && !config.dry_run {
                dst.batch_put(std::mem::take(&mut batch)).await?;
            }
        }

        if !batch.is_empty() && !config.dry_run {
            dst.batch_put(batch).await?;
        }

        // deleting only after the full copy keeps the source intact when the
        // step dies half way
        if delete_source && !config.dry_run {
            for key in &copied {
                if let Err(e) = src.delete(key).await {
                    warn!("step {}: failed to delete moved key: {e}", step.id);
                    result.error_count += 1;
                }
            }
        }

        result.success = result.error_count == 0;
        result.duration_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }

    async fn validate_records(
        &self,
        ctx: &CancellationToken,
        step: &MigrationStep,
        src: &Arc<dyn DataStore>,
        dst: &Arc<dyn DataStore>,
    ) -> Result<StepResult> {
        let started = Instant::now();
        let mut result = new_step_result(step);

        let mut entries = src.scan(&[]).await;
        while let Some(record) = entries.next().await {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let (key_bytes, value) = record?;
            let key = match String::from_utf8(key_bytes) {
                Ok(key) => key,
                Err(_) => {
                    result.error_count += 1;
                    continue;
                }
            };

            if !step.keeps(&key, &value) {
                result.skipped_count += 1;
                continue;
            }

            let dest_key = step.destination_key(&key);
            let expected = match step.destination_value(value) {
                Ok(value) => value,
                Err(_) => {
                    result.error_count += 1;
                    continue;
                }
            };

            result.record_count += 1;
            result.byte_count += expected.len() as u64;

            match dst.get(dest_key.as_bytes()).await? {
                Some(found) if found == expected => {}
                Some(_) => {
                    warn!("step {}: value mismatch for {dest_key:?}", step.id);
                    result.error_count += 1;
                }
                None => {
                    warn!("step {}: destination missing {dest_key:?}", step.id);
                    result.error_count += 1;
                }
            }
        }

        result.success = result.error_count == 0;
        result.duration_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }

    /// Removes destination records selected by the step's filters; with no
    /// filters there is nothing to clean and the step trivially succeeds.
    async fn cleanup_records(
        &self,
        ctx: &CancellationToken,
        step: &MigrationStep,
        dst: &Arc<dyn DataStore>,
        config: &MigrationConfig,
    ) -> Result<StepResult> {
        let started = Instant::now();
        let mut result = new_step_result(step);

        if !step.filters.is_empty() {
            let mut doomed = Vec::new();
            {
                let mut entries = dst.scan(&[]).await;
                while let Some(record) = entries.next().await {
                    if ctx.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    let (key_bytes, value) = record?;
                    let Ok(key) = String::from_utf8(key_bytes.clone()) else {
                        continue;
                    };
                    if step.keeps(&key, &value) {
                        doomed.push(key_bytes);
                        result.byte_count += value.len() as u64;
                    }
                }
            }

            for key in doomed {
                result.record_count += 1;
                if config.dry_run {
                    continue;
                }
                if let Err(e) = dst.delete(&key).await {
                    warn!("step {}: cleanup delete failed: {e}", step.id);
                    result.error_count += 1;
                }
            }
        }

        result.success = result.error_count == 0;
        result.duration_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }
}

fn new_step_result(step: &MigrationStep) -> StepResult {
    StepResult {
        step_id: step.id.clone(),
        kind: step.kind,
        success: true,
        record_count: 0,
        byte_count: 0,
        error_count: 0,
        skipped_count: 0,
        duration_ms: 0,
    }
}
