//! High-level client API.

use crate::config::Config;
use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use crate::stream::Transport;
use hsmwire_deadline::{Deadline, DeadlineCoordinator};
use hsmwire_protocol::{CodecConfig, CommandTable, Fields};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Parameters of a key generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateKey {
    /// `0` to generate, `1` to generate and export.
    pub mode: String,
    /// Three-character key type code.
    pub key_type: String,
    /// Key scheme under the LMK (`U`, `T`, ...).
    pub key_scheme: String,
    /// Alternate LMK slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lmk_id: Option<u32>,
}

impl GenerateKey {
    pub fn new(key_type: impl Into<String>, key_scheme: impl Into<String>) -> Self {
        Self {
            mode: "0".to_string(),
            key_type: key_type.into(),
            key_scheme: key_scheme.into(),
            lmk_id: None,
        }
    }

    pub fn with_lmk(mut self, lmk_id: u32) -> Self {
        self.lmk_id = Some(lmk_id);
        self
    }
}

/// Result of a key generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateKeyResult {
    /// Key encrypted under the LMK.
    pub key: String,
    pub check_value: String,
    /// `"00"` or the warning status the HSM reported.
    #[serde(rename = "error_code")]
    pub status: String,
}

/// Result of a diagnostics request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsResult {
    pub lmk_check: String,
    pub firmware: String,
}

/// High-level client for an HSM.
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(
        config: ConnectionConfig,
        table: Arc<CommandTable>,
        codec: &CodecConfig,
        coordinator: DeadlineCoordinator,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            conn: Arc::new(Connection::new(config, table, codec, coordinator)?),
        })
    }

    /// Creates a client from a loaded [`Config`].
    pub fn from_config(
        config: &Config,
        table: Arc<CommandTable>,
        coordinator: DeadlineCoordinator,
    ) -> Result<Self, ClientError> {
        Self::new(
            ConnectionConfig::from(&config.network),
            table,
            &config.protocol,
            coordinator,
        )
    }

    /// Connects to the HSM.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await
    }

    /// Uses an established stream as the transport.
    pub async fn attach(&self, stream: impl Transport + 'static) {
        self.conn.attach(stream).await
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection (for background read loop).
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    // =========================================================================
    // Generic calls
    // =========================================================================

    /// Sends any catalog command with the default deadline.
    pub async fn call(&self, method: &str, fields: &Fields) -> Result<Fields, ClientError> {
        self.conn.request(method, fields, None).await
    }

    /// Sends any catalog command bounded by `deadline`.
    pub async fn call_with_deadline(
        &self,
        method: &str,
        fields: &Fields,
        deadline: Deadline,
    ) -> Result<Fields, ClientError> {
        self.conn.request(method, fields, Some(deadline)).await
    }

    async fn request<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<R, ClientError> {
        let fields: Fields = serde_json::from_value(params)?;
        let reply = self.call(method, &fields).await?;
        Ok(serde_json::from_value(serde_json::to_value(reply)?)?)
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Generates a key and returns it with its check value.
    pub async fn generate_key(&self, params: &GenerateKey) -> Result<GenerateKeyResult, ClientError> {
        self.request("generate_key", serde_json::to_value(params)?)
            .await
    }

    /// Runs HSM diagnostics.
    pub async fn diagnostics(&self) -> Result<DiagnosticsResult, ClientError> {
        self.request("diagnostics", json!({})).await
    }

    /// Sends `data` and returns what the HSM echoed back.
    pub async fn echo(&self, data: &str) -> Result<String, ClientError> {
        let params = json!({
            "length": data.len(),
            "data": data,
        });

        let reply: Value = self.request("echo", params).await?;
        reply["data"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ClientError::UnexpectedReply("echo reply without data".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsmwire_protocol::FieldValue;

    #[test]
    fn test_generate_key_params_to_fields() {
        let params = GenerateKey::new("000", "U").with_lmk(1);
        let fields: Fields = serde_json::from_value(serde_json::to_value(&params).unwrap()).unwrap();
        assert_eq!(fields["key_type"], FieldValue::from("000"));
        assert_eq!(fields["lmk_id"], FieldValue::from(1u64));

        let fields: Fields =
            serde_json::from_value(serde_json::to_value(GenerateKey::new("000", "U")).unwrap())
                .unwrap();
        assert!(!fields.contains_key("lmk_id"));
    }

    #[test]
    fn test_result_from_fields() {
        let fields = hsmwire_protocol::fields([
            ("key", "UABC"),
            ("check_value", "123456"),
            ("error_code", "02"),
        ]);
        let result: GenerateKeyResult =
            serde_json::from_value(serde_json::to_value(fields).unwrap()).unwrap();
        assert_eq!(result.check_value, "123456");
        assert_eq!(result.status, "02");
    }
}
