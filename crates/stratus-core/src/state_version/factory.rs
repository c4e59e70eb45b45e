// Copyright (C) 2025 The Stratus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Construction and validation of new state versions.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;

use crate::clock::current_timestamp;
use crate::error::{Error, Result};
use crate::ids::{STATE_VERSION_OUTPUT_PREFIX, STATE_VERSION_PREFIX, new_id};

use super::{CreateStateVersionOptions, StateVersion, StateVersionOutput};

/// Builds a [`StateVersion`] from create options, rejecting invalid input.
///
/// Implementations may consult other services (e.g. to check serial and
/// lineage against the workspace's current version) before building.
#[async_trait]
pub trait StateVersionFactory: Send + Sync {
    /// Build a new, not yet persisted, state version for `workspace_id`.
    async fn new_state_version(
        &self,
        workspace_id: &str,
        opts: &CreateStateVersionOptions,
    ) -> Result<StateVersion>;
}

/// Factory that validates the payload itself and nothing else.
///
/// Requires a non-negative serial and a well-formed base64 payload. If the
/// decoded payload is a JSON state document, its root outputs and lineage
/// are recorded; anything else is stored as-is with no outputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStateVersionFactory;

#[derive(Deserialize)]
struct StateDocument {
    #[serde(default)]
    lineage: Option<String>,
    #[serde(default)]
    outputs: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct StateDocumentOutput {
    value: serde_json::Value,
    #[serde(default, rename = "type")]
    output_type: Option<serde_json::Value>,
    #[serde(default)]
    sensitive: bool,
}

#[async_trait]
impl StateVersionFactory for DefaultStateVersionFactory {
    async fn new_state_version(
        &self,
        workspace_id: &str,
        opts: &CreateStateVersionOptions,
    ) -> Result<StateVersion> {
        if workspace_id.is_empty() {
            return Err(Error::Validation("workspace id is required".into()));
        }
        if opts.serial < 0 {
            return Err(Error::Validation(format!(
                "serial must not be negative, got {}",
                opts.serial
            )));
        }
        let raw = STANDARD
            .decode(opts.state.as_bytes())
            .map_err(|e| Error::Validation(format!("state is not valid base64: {e}")))?;

        let (lineage, outputs) = match serde_json::from_slice::<StateDocument>(&raw) {
            Ok(doc) => (doc.lineage, parse_outputs(doc.outputs)?),
            Err(_) => (None, Vec::new()),
        };

        Ok(StateVersion {
            id: new_id(STATE_VERSION_PREFIX),
            workspace_id: workspace_id.to_string(),
            serial: opts.serial,
            lineage: opts.lineage.clone().or(lineage),
            state: opts.state.clone(),
            run_id: opts.run_id.clone(),
            created_at: current_timestamp(),
            seq: 0,
            outputs,
        })
    }
}

fn parse_outputs(
    outputs: serde_json::Map<String, serde_json::Value>,
) -> Result<Vec<StateVersionOutput>> {
    let mut parsed = outputs
        .into_iter()
        .map(|(name, raw)| {
            let out: StateDocumentOutput = serde_json::from_value(raw)
                .map_err(|e| Error::Validation(format!("output {name}: {e}")))?;
            let output_type = match out.output_type {
                None => infer_type(&out.value).to_string(),
                Some(serde_json::Value::String(t)) => t,
                Some(t) => t.to_string(),
            };
            Ok(StateVersionOutput {
                id: new_id(STATE_VERSION_OUTPUT_PREFIX),
                name,
                output_type,
                value: out.value,
                sensitive: out.sensitive,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    // Stored outputs are read back ordered by name.
    parsed.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(parsed)
}

fn infer_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "tuple",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts(state: &[u8], serial: i64) -> CreateStateVersionOptions {
        CreateStateVersionOptions {
            serial,
            state: STANDARD.encode(state),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_extracts_outputs_and_lineage() {
        let doc = json!({
            "version": 4,
            "serial": 3,
            "lineage": "b2c1",
            "outputs": {
                "vpc_id": {"value": "vpc-123", "type": "string"},
                "azs": {"value": ["a", "b"], "type": ["list", "string"]},
                "db_password": {"value": "hunter2", "type": "string", "sensitive": true}
            }
        });
        let sv = DefaultStateVersionFactory
            .new_state_version("ws-1", &opts(doc.to_string().as_bytes(), 3))
            .await
            .unwrap();

        assert!(sv.id.starts_with("sv-"));
        assert_eq!(sv.lineage.as_deref(), Some("b2c1"));
        let names: Vec<_> = sv.outputs.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, ["azs", "db_password", "vpc_id"]);
        assert_eq!(sv.outputs[0].output_type, r#"["list","string"]"#);
        assert!(sv.outputs[1].sensitive);
        assert_eq!(sv.outputs[2].value, json!("vpc-123"));
    }

    #[tokio::test]
    async fn test_opaque_payload_has_no_outputs() {
        let sv = DefaultStateVersionFactory
            .new_state_version("ws-1", &opts(&[0xde, 0xad, 0xbe, 0xef], 0))
            .await
            .unwrap();
        assert!(sv.outputs.is_empty());
        assert!(sv.lineage.is_none());
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let err = DefaultStateVersionFactory
            .new_state_version("ws-1", &opts(b"{}", -1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let bad = CreateStateVersionOptions {
            serial: 1,
            state: "not base64!".into(),
            ..Default::default()
        };
        let err = DefaultStateVersionFactory
            .new_state_version("ws-1", &bad)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_explicit_lineage_wins() {
        let mut o = opts(br#"{"lineage":"from-doc"}"#, 1);
        o.lineage = Some("explicit".into());
        let sv = DefaultStateVersionFactory
            .new_state_version("ws-1", &o)
            .await
            .unwrap();
        assert_eq!(sv.lineage.as_deref(), Some("explicit"));
    }
}
