//! Rewriting the load parameters of a serialized script.
//!
//! Scripts travel as JSON documents. The runner reads its load parameters
//! from the `thread_group` object, so every thread/iteration/ramp override
//! is written there rather than kept beside the script.

use serde_json::{Map, Value};
use thiserror::Error;

use super::ThreadConfig;

/// Key of the thread group object inside a script.
pub const THREAD_GROUP_KEY: &str = "thread_group";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("script body is empty")]
    Empty,
    #[error("script is not valid JSON: {0}")]
    Parse(String),
    #[error("script must be a JSON object")]
    NotAnObject,
}

/// Return `script` with its thread group replaced by `threads`.
pub fn apply_threads(script: &str, threads: &ThreadConfig) -> Result<String, ScriptError> {
    if script.trim().is_empty() {
        return Err(ScriptError::Empty);
    }

    let mut doc: Value =
        serde_json::from_str(script).map_err(|e| ScriptError::Parse(e.to_string()))?;
    let root = doc.as_object_mut().ok_or(ScriptError::NotAnObject)?;

    let group = root
        .entry(THREAD_GROUP_KEY)
        .or_insert_with(|| Value::Object(Map::new()));
    if !group.is_object() {
        *group = Value::Object(Map::new());
    }
    let Some(group) = group.as_object_mut() else {
        return Err(ScriptError::NotAnObject);
    };

    group.insert("thread_count".into(), threads.thread_count.into());
    group.insert("iteration_count".into(), threads.iteration_count.into());

    match threads.ramp {
        Some(ramp) => {
            group.insert("ramp_up_threads".into(), ramp.ramp_up_threads.into());
            group.insert("ramp_down_threads".into(), ramp.ramp_down_threads.into());
            group.insert("ramp_up_secs".into(), ramp.ramp_up_secs.into());
            group.insert("ramp_down_secs".into(), ramp.ramp_down_secs.into());
        }
        None => {
            for key in [
                "ramp_up_threads",
                "ramp_down_threads",
                "ramp_up_secs",
                "ramp_down_secs",
            ] {
                group.remove(key);
            }
        }
    }

    match threads.duration_secs {
        Some(secs) => {
            group.insert("duration_secs".into(), secs.into());
        }
        None => {
            group.remove("duration_secs");
        }
    }

    serde_json::to_string(&doc).map_err(|e| ScriptError::Parse(e.to_string()))
}
