// src/pipeline/fanout.rs

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::config::job::FanOutConfig;
use crate::data_model::InputRow;
use crate::error::Result;
use crate::pipeline::batcher::split_into_batches;
use crate::pipeline::sources::Source;

/// Everything a remote worker needs to fetch one row.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(flatten)]
    pub params: BTreeMap<String, String>,
    #[serde(rename = "API_KEY", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Keys owned by the descriptor itself; row fields with these names are dropped.
const RESERVED_KEYS: [&str; 2] = ["ID", "API_KEY"];

impl TaskDescriptor {
    pub fn for_row(source: &dyn Source, input: &InputRow) -> Result<Self> {
        let mut params = source.task_params(input)?;
        params.retain(|key, _| !RESERVED_KEYS.contains(&key.as_str()));
        Ok(TaskDescriptor {
            id: input.id.clone(),
            params,
            api_key: source.credential().map(str::to_string),
        })
    }
}

/// One orchestrator execution: a list of batches, each handed to one worker invocation.
pub type Invocation = Vec<Vec<TaskDescriptor>>;

/// Splits tasks into `superbatches` executions of `batches_per_invocation` batches each.
pub fn plan_invocations(
    tasks: Vec<TaskDescriptor>,
    config: &FanOutConfig,
) -> Result<Vec<Invocation>> {
    split_into_batches(tasks, config.superbatches)?
        .into_iter()
        .map(|superbatch| split_into_batches(superbatch, config.batches_per_invocation))
        .collect()
}

/// State-machine definition mapping a worker over one execution's batches.
pub fn state_machine_definition(config: &FanOutConfig) -> Value {
    json!({
        "Comment": "Fan out fetch batches to remote workers",
        "StartAt": "FetchBatches",
        "States": {
            "FetchBatches": {
                "Type": "Map",
                "MaxConcurrency": config.max_concurrency,
                "ItemsPath": "$.batches",
                "Iterator": {
                    "StartAt": "FetchBatch",
                    "States": {
                        "FetchBatch": {
                            "Type": "Task",
                            "Resource": config.worker_resource,
                            "Retry": [{
                                "ErrorEquals": config.retry.error_equals,
                                "IntervalSeconds": config.retry.interval_seconds,
                                "MaxAttempts": config.retry.max_attempts,
                                "BackoffRate": config.retry.backoff_rate
                            }],
                            "End": true
                        }
                    }
                },
                "End": true
            }
        }
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(fs::File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

/// Writes `definition.json` plus one `execution_NNNN.json` per invocation into `dir`.
/// Returns the number of execution files written.
pub fn write_fanout(
    dir: &Path,
    config: &FanOutConfig,
    invocations: &[Invocation],
) -> Result<usize> {
    fs::create_dir_all(dir)?;
    write_json(
        &dir.join("definition.json"),
        &state_machine_definition(config),
    )?;
    for (index, invocation) in invocations.iter().enumerate() {
        write_json(
            &dir.join(format!("execution_{:04}.json", index)),
            &json!({ "batches": invocation }),
        )?;
    }
    info!(
        executions = invocations.len(),
        dir = %dir.display(),
        "Fan-out payloads written"
    );
    Ok(invocations.len())
}
