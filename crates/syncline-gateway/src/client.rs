use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use syncline_core::config::GatewayConfig;
use syncline_core::error::SyncError;
use syncline_core::retry::RetryCircuit;
use syncline_core::spec::{FieldKind, FieldSpec, TableSpec};
use syncline_core::value::{row_i64, row_text, Row};
use tracing::debug;

use crate::decode::{decode_delimited, decode_rows};
use crate::report::{
    alter_ids_payload, company_info_payload, list_companies_payload, ReportContext,
};
use crate::wire;

/// Circuit-breaker dependency name for all gateway traffic.
pub const GATEWAY_DEPENDENCY: &str = "gateway";

/// Extraction seam between the synchronizer and the wire. Production code
/// uses [`GatewayClient`]; tests script the responses.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Requests, receives, and decodes one table's rows for `company`.
    async fn export(&self, spec: &TableSpec, company: &str) -> Result<Vec<Row>, SyncError>;

    /// Metadata for the target (or active) company.
    async fn company_info(&self, company: &str) -> Result<CompanyInfo, SyncError>;

    /// Current master/transaction revision counters for the target company.
    async fn last_alter_ids(&self, company: &str) -> Result<AlterIds, SyncError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct CompanyInfo {
    pub name: String,
    pub books_from: Option<String>,
    pub last_voucher_date: Option<String>,
    pub guid: String,
    pub alter_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AlterIds {
    pub master: i64,
    pub transaction: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompanyListing {
    pub name: String,
    pub number: String,
    pub books_from: Option<String>,
    pub books_to: Option<String>,
}

/// Outcome of the connection probe surfaced to operators.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProbe {
    pub ok: bool,
    pub server: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn classify_transport(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::Timeout(err.to_string())
    } else if let Some(status) = err.status() {
        SyncError::Network(format!("gateway returned HTTP {status}"))
    } else {
        SyncError::Network(err.to_string())
    }
}

fn meta_field(name: &str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name: name.to_string(),
        expr: name.to_string(),
        kind,
    }
}

/// HTTP client for the gateway's report endpoint. Every call goes through
/// the shared retry/circuit layer; payloads travel UTF-16LE and responses
/// come back through the decode cascade.
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    server: String,
    port: u16,
    context: ReportContext,
    circuit: Arc<RetryCircuit>,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig, circuit: Arc<RetryCircuit>) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|err| SyncError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            base_url: format!("http://{}:{}", config.host, config.port),
            server: config.host.clone(),
            port: config.port,
            context: ReportContext::new(&config.from_date, &config.to_date),
            circuit,
        })
    }

    /// Sends one payload and returns the decoded response text.
    pub async fn send(&self, payload: &str) -> Result<String, SyncError> {
        let body = wire::encode_request(payload);
        let http = self.http.clone();
        let url = self.base_url.clone();
        self.circuit
            .run(GATEWAY_DEPENDENCY, move || {
                let http = http.clone();
                let url = url.clone();
                let body = body.clone();
                async move {
                    let response = http
                        .post(&url)
                        .header(CONTENT_TYPE, wire::REQUEST_CONTENT_TYPE)
                        .body(body)
                        .send()
                        .await
                        .map_err(classify_transport)?
                        .error_for_status()
                        .map_err(classify_transport)?;
                    let bytes = response.bytes().await.map_err(classify_transport)?;
                    Ok(wire::decode_body(&bytes))
                }
            })
            .await
    }

    /// Issues the list-companies request and reports reachability.
    pub async fn test_connection(&self) -> ConnectionProbe {
        match self.send(&list_companies_payload()).await {
            Ok(response) if !response.trim().is_empty() => ConnectionProbe {
                ok: true,
                server: self.server.clone(),
                port: self.port,
                error: None,
            },
            Ok(_) => ConnectionProbe {
                ok: false,
                server: self.server.clone(),
                port: self.port,
                error: Some("gateway returned an empty response".to_string()),
            },
            Err(err) => ConnectionProbe {
                ok: false,
                server: self.server.clone(),
                port: self.port,
                error: Some(err.to_string()),
            },
        }
    }

    /// All companies currently open on the gateway.
    pub async fn list_companies(&self) -> Result<Vec<CompanyListing>, SyncError> {
        let response = self.send(&list_companies_payload()).await?;
        let fields = [
            meta_field("name", FieldKind::Text),
            meta_field("number", FieldKind::Text),
            meta_field("books_from", FieldKind::Date),
            meta_field("books_to", FieldKind::Date),
        ];
        let rows = decode_rows(&response, &fields, "company_list")?;
        debug!(count = rows.len(), "companies open on gateway");
        Ok(rows
            .into_iter()
            .filter(|row| !row_text(row, "name").is_empty())
            .map(|row| CompanyListing {
                name: row_text(&row, "name").to_string(),
                number: row_text(&row, "number").to_string(),
                books_from: row.get("books_from").and_then(|v| v.as_str()).map(String::from),
                books_to: row.get("books_to").and_then(|v| v.as_str()).map(String::from),
            })
            .collect())
    }
}

#[async_trait]
impl Gateway for GatewayClient {
    async fn export(&self, spec: &TableSpec, company: &str) -> Result<Vec<Row>, SyncError> {
        let payload = self.context.export_payload(spec, company);
        let response = self.send(&payload).await?;
        decode_rows(&response, &spec.fields, &spec.name)
    }

    async fn company_info(&self, company: &str) -> Result<CompanyInfo, SyncError> {
        let response = self.send(&company_info_payload(company)).await?;
        let fields = [
            meta_field("name", FieldKind::Text),
            meta_field("books_from", FieldKind::Date),
            meta_field("last_voucher_date", FieldKind::Date),
            meta_field("guid", FieldKind::Text),
            meta_field("alter_id", FieldKind::Number),
        ];
        let rows = decode_rows(&response, &fields, "company_info")?;
        let row = rows.into_iter().next().ok_or_else(|| {
            SyncError::decode("company_info", "gateway returned no company record")
        })?;
        Ok(CompanyInfo {
            name: row_text(&row, "name").to_string(),
            books_from: row.get("books_from").and_then(|v| v.as_str()).map(String::from),
            last_voucher_date: row
                .get("last_voucher_date")
                .and_then(|v| v.as_str())
                .map(String::from),
            guid: row_text(&row, "guid").to_string(),
            alter_id: row_i64(&row, "alter_id"),
        })
    }

    async fn last_alter_ids(&self, company: &str) -> Result<AlterIds, SyncError> {
        let response = self.send(&alter_ids_payload(company)).await?;
        let rows = decode_delimited(&response, &["master", "transaction"], ',');
        let row = rows.first();
        Ok(AlterIds {
            master: row.map(|row| row_i64(row, "master")).unwrap_or(0),
            transaction: row.map(|row| row_i64(row, "transaction")).unwrap_or(0),
        })
    }
}
