//! Gateway-facing layer: request generation, wire exchange, response decoding.
//!
//! The report builder turns declarative table specs into the gateway's
//! report-definition payloads, the client speaks the gateway's UTF-16 HTTP
//! dialect behind the retry/circuit layer, and the decoder slices the flat
//! positional responses back into typed rows.

pub mod client;
pub mod decode;
pub mod report;
pub mod wire;

pub use client::{
    AlterIds, CompanyInfo, CompanyListing, ConnectionProbe, Gateway, GatewayClient,
};
pub use decode::{decode_delimited, decode_rows, parse_gateway_date, NULL_SENTINEL};
pub use report::{
    alter_ids_payload, company_info_payload, list_companies_payload, ReportContext,
};
