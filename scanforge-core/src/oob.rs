//! Out-of-band interaction correlation.
//!
//! Audits inject payloads carrying a globally unique identifier; any
//! DNS/HTTP/LDAP/SMTP callback that echoes the identifier lands here and is
//! matched back to the `OobTest` that planted it. The store locks the test
//! row (`FOR UPDATE`) while deciding whether to create a finding or append
//! to the existing one, so a burst of callbacks for one payload coalesces
//! into a single issue that grows in detail.

use std::sync::Arc;

use base64::prelude::*;
use tracing::{debug, info};

use crate::error::Result;
use crate::store::ScanStore;
use crate::types::{
    CorrelationOutcome, NewOobInteraction, NewOobTest, OobInteraction, OobTest, Severity,
};

/// Confidence assigned to findings proven by a received interaction.
pub const OOB_CONFIDENCE: i32 = 80;

pub struct OobCorrelator {
    store: Arc<dyn ScanStore>,
}

impl OobCorrelator {
    pub fn new(store: Arc<dyn ScanStore>) -> Self {
        Self { store }
    }

    /// Persist a test before its payload goes out. The full id is
    /// normalized and a non-UTF-8 payload is stored base64-encoded.
    pub async fn record_test(&self, test: &NewOobTest) -> Result<OobTest> {
        self.store.insert_oob_test(test).await
    }

    /// Correlate one inbound callback. A miss is expected for stale
    /// identifiers and drops the interaction.
    pub async fn handle(&self, interaction: &NewOobInteraction) -> Result<CorrelationOutcome> {
        let normalized = normalize_full_id(&interaction.full_id);
        let outcome = self
            .store
            .correlate_oob_interaction(&normalized, interaction)
            .await?;

        match outcome {
            CorrelationOutcome::NoMatch => {
                debug!(full_id = %normalized, protocol = %interaction.protocol,
                    "no matching oob test, dropping interaction");
            }
            CorrelationOutcome::Promoted { issue_id } => {
                info!(full_id = %normalized, issue_id = %issue_id,
                    "oob interaction promoted test to issue");
            }
            CorrelationOutcome::Appended { issue_id } => {
                debug!(full_id = %normalized, issue_id = %issue_id,
                    "oob interaction appended to existing issue");
            }
        }
        Ok(outcome)
    }
}

// ─── Pure helpers shared by the store backends ────────────────

/// Lowercase and strip any `scheme://` prefix.
pub fn normalize_full_id(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    match lowered.split_once("://") {
        Some((_, rest)) => rest.to_string(),
        None => lowered,
    }
}

/// Payloads are stored as text; non-UTF-8 bytes go through standard base64
/// with a note recording the original length.
pub fn encode_payload(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => format!(
            "{} (base64-encoded, original {} bytes)",
            BASE64_STANDARD.encode(raw),
            raw.len()
        ),
    }
}

/// Issue copy resolved from the test's code. The full vulnerability catalog
/// lives outside this crate; this table covers the OOB-capable codes and
/// falls back to a generic out-of-band finding.
pub(crate) struct IssueTemplate {
    pub title: &'static str,
    pub description: &'static str,
    pub severity: Severity,
}

pub(crate) fn resolve_template(code: &str) -> IssueTemplate {
    match code {
        "blind_ssrf" => IssueTemplate {
            title: "Blind Server-Side Request Forgery",
            description: "The application fetched an attacker-supplied URL. The request \
                          was observed out-of-band, confirming the server can be made to \
                          issue arbitrary outbound requests.",
            severity: Severity::High,
        },
        "os_command_injection" => IssueTemplate {
            title: "OS Command Injection (Out-of-Band)",
            description: "An injected operating system command triggered an out-of-band \
                          interaction from the target host.",
            severity: Severity::Critical,
        },
        "blind_sql_injection" => IssueTemplate {
            title: "Blind SQL Injection (Out-of-Band)",
            description: "A database function call embedded in the payload produced an \
                          out-of-band interaction, confirming SQL execution.",
            severity: Severity::Critical,
        },
        "xxe" => IssueTemplate {
            title: "XML External Entity Injection",
            description: "An external entity declared in submitted XML was resolved by \
                          the server, observed as an out-of-band interaction.",
            severity: Severity::High,
        },
        "log4shell" => IssueTemplate {
            title: "Remote JNDI Lookup (Log4Shell-class)",
            description: "A logged lookup expression caused the server to resolve an \
                          attacker-controlled JNDI endpoint.",
            severity: Severity::Critical,
        },
        _ => IssueTemplate {
            title: "Out-of-Band Interaction",
            description: "A unique identifier planted by a scanner payload was echoed \
                          back through an external interaction, proving the payload was \
                          processed.",
            severity: Severity::Medium,
        },
    }
}

/// Render the issue details from the full interaction list. Interactions
/// are ordered by `timestamp ASC` regardless of arrival order.
pub(crate) fn render_details(test: &OobTest, interactions: &[OobInteraction]) -> String {
    let mut ordered: Vec<&OobInteraction> = interactions.iter().collect();
    ordered.sort_by_key(|i| i.timestamp);

    let mut out = String::new();
    out.push_str(&format!(
        "Test: {}\nTarget: {}\nIdentifier: {}\n",
        test.test_name, test.target, test.interaction_full_id
    ));
    if let Some(point) = &test.insertion_point {
        out.push_str(&format!("Insertion point: {point}\n"));
    }
    if let Some(payload) = &test.payload {
        out.push_str(&format!("Payload: {payload}\n"));
    }
    out.push_str(&format!(
        "\nReceived {} interaction(s):\n",
        ordered.len()
    ));

    for (idx, interaction) in ordered.iter().enumerate() {
        out.push_str(&format!(
            "\n--- Interaction {} ---\nProtocol: {}\nAt: {}\n",
            idx + 1,
            interaction.protocol,
            interaction.timestamp.to_rfc3339()
        ));
        if let Some(qtype) = &interaction.qtype {
            out.push_str(&format!("Query type: {qtype}\n"));
        }
        if let Some(addr) = &interaction.remote_address {
            out.push_str(&format!("From: {addr}\n"));
        }
        if let Some(req) = &interaction.raw_request {
            out.push_str(&format!("Request:\n{req}\n"));
        }
        if let Some(resp) = &interaction.raw_response {
            out.push_str(&format!("Response:\n{resp}\n"));
        }
    }
    out
}
