//! The export capsule: a single self-contained text document carrying a
//! conversation projection plus everything needed to re-check it offline.
//!
//! A capsule embeds a JSON payload (conversation id, title, message entries
//! with id/role/content/signature/author), a payload checksum, and an inline
//! human-readable verification procedure. `Private` mode gates rendering
//! only — the payload stays embedded in cleartext. It is a forward-compatible
//! display hint, not a confidentiality boundary, and the document itself says
//! so; genuinely confidential sharing goes through the privacy manager's
//! envelope.

use braid_core_types::NodeId;
use braid_types::node::{NodeBody, SignedNode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use thiserror::Error;

const HEADER: &str = "BRAID CAPSULE v1";
const PAYLOAD_BEGIN: &str = "----- BEGIN PAYLOAD -----";
const PAYLOAD_END: &str = "----- END PAYLOAD -----";
const VERIFICATION_BEGIN: &str = "----- VERIFICATION -----";

#[derive(Error, Debug)]
pub enum CapsuleError {
    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CapsuleMode {
    Open,
    Private,
}

impl CapsuleMode {
    fn as_str(self) -> &'static str {
        match self {
            CapsuleMode::Open => "open",
            CapsuleMode::Private => "private",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "open" => Some(CapsuleMode::Open),
            "private" => Some(CapsuleMode::Private),
            _ => None,
        }
    }
}

/// One embedded message: the minimal projection of a message node.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CapsuleEntry {
    pub id: String,
    pub role: String,
    pub content: String,
    /// Hex-encoded Ed25519 signature from the original node.
    pub signature: String,
    /// Author DID string.
    pub author: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CapsulePayload {
    pub conversation: String,
    pub title: String,
    pub entries: Vec<CapsuleEntry>,
}

/// Result of parsing a capsule document. Malformed payloads come back as
/// `data: None` rather than an error, so callers can attempt partial
/// recovery from whatever survived.
#[derive(Clone, Debug)]
pub struct ImportedCapsule {
    pub mode: Option<CapsuleMode>,
    pub data: Option<CapsulePayload>,
    pub checksum_valid: bool,
}

/// How a render attempt turned out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RenderStatus {
    /// Every entry carried a non-empty author and signature.
    Verified,
    /// The structural check failed; the reason names the first problem.
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct RenderedCapsule {
    pub status: RenderStatus,
    /// Rendered transcript lines. Empty for `Private` capsules, whose
    /// content is withheld regardless of status.
    pub lines: Vec<String>,
}

/// Serialize a conversation into a capsule document. Only message nodes
/// contribute entries; structural nodes are reachable through the store,
/// not the capsule.
pub fn export(
    conversation: &NodeId,
    title: &str,
    nodes: &[SignedNode],
    mode: CapsuleMode,
) -> Result<String, CapsuleError> {
    let entries: Vec<CapsuleEntry> = nodes
        .iter()
        .filter_map(|node| {
            let id = node.id.as_ref()?;
            match &node.node.body {
                NodeBody::Message(body) => Some(CapsuleEntry {
                    id: id.to_string(),
                    role: body.role.to_string(),
                    content: body.content.display_text(),
                    signature: hex::encode(&node.signature),
                    author: node.node.author.to_string(),
                }),
                _ => None,
            }
        })
        .collect();

    let payload = CapsulePayload {
        conversation: conversation.to_string(),
        title: title.to_string(),
        entries,
    };
    let payload_json = serde_json::to_string_pretty(&payload)?;
    let checksum = hex::encode(Sha256::digest(payload_json.as_bytes()));

    let mut doc = String::new();
    doc.push_str(HEADER);
    doc.push('\n');
    doc.push_str(&format!("mode: {}\n", mode.as_str()));
    doc.push_str(&format!("payload-sha256: {}\n", checksum));
    doc.push_str(PAYLOAD_BEGIN);
    doc.push('\n');
    doc.push_str(&payload_json);
    doc.push('\n');
    doc.push_str(PAYLOAD_END);
    doc.push('\n');
    doc.push_str(VERIFICATION_BEGIN);
    doc.push('\n');
    doc.push_str(
        "This capsule is self-contained. To verify it offline:\n\
         1. Recompute SHA-256 over the exact text between the BEGIN/END\n\
            PAYLOAD markers (excluding the marker lines and their trailing\n\
            newlines) and compare with the payload-sha256 header.\n\
         2. Check that every entry carries a non-empty author and signature.\n\
         3. For cryptographic verification, match each entry id against the\n\
            originating store and verify its Ed25519 signature against the\n\
            author's did:key public key.\n\
         A capsule in private mode withholds rendering only; the payload\n\
         above is not encrypted and this document is not a confidentiality\n\
         boundary.\n",
    );
    Ok(doc)
}

/// Parse a capsule document. Never errors: a malformed document yields
/// `None` fields so the caller can recover what it can.
pub fn import(document: &str) -> ImportedCapsule {
    let mut mode = None;
    let mut declared_checksum: Option<String> = None;

    for line in document.lines().take_while(|line| *line != PAYLOAD_BEGIN) {
        if let Some(value) = line.strip_prefix("mode:") {
            mode = CapsuleMode::parse(value);
        } else if let Some(value) = line.strip_prefix("payload-sha256:") {
            declared_checksum = Some(value.trim().to_string());
        }
    }

    let payload_text = document
        .split_once(PAYLOAD_BEGIN)
        .and_then(|(_, rest)| rest.split_once(PAYLOAD_END))
        .map(|(payload, _)| payload.trim_matches('\n'));

    let (data, checksum_valid) = match payload_text {
        Some(text) => {
            let checksum_valid = declared_checksum
                .map(|declared| hex::encode(Sha256::digest(text.as_bytes())) == declared)
                .unwrap_or(false);
            (serde_json::from_str::<CapsulePayload>(text).ok(), checksum_valid)
        }
        None => (None, false),
    };

    ImportedCapsule {
        mode,
        data,
        checksum_valid,
    }
}

impl ImportedCapsule {
    /// Structural verification and rendering. Reports `Verified` only when
    /// every entry carries a non-empty author and signature; `Private`
    /// capsules verify the same way but render nothing.
    pub fn render(&self) -> RenderedCapsule {
        let payload = match &self.data {
            Some(payload) => payload,
            None => {
                return RenderedCapsule {
                    status: RenderStatus::Failed("capsule payload is malformed".to_string()),
                    lines: Vec::new(),
                }
            }
        };

        for entry in &payload.entries {
            if entry.author.is_empty() || entry.signature.is_empty() {
                return RenderedCapsule {
                    status: RenderStatus::Failed(format!(
                        "entry {} is missing author or signature",
                        entry.id
                    )),
                    lines: Vec::new(),
                };
            }
        }
        if !self.checksum_valid {
            return RenderedCapsule {
                status: RenderStatus::Failed("payload checksum mismatch".to_string()),
                lines: Vec::new(),
            };
        }

        let lines = match self.mode {
            Some(CapsuleMode::Private) => Vec::new(),
            _ => payload
                .entries
                .iter()
                .map(|entry| format!("{}: {}", entry.role, entry.content))
                .collect(),
        };
        RenderedCapsule {
            status: RenderStatus::Verified,
            lines,
        }
    }

    /// The stronger, caller-invoked verification mode: match entries by id
    /// against full nodes (typically fetched from a store) and run complete
    /// content-address plus signature verification on each. Returns the ids
    /// that failed, empty meaning everything checked out.
    pub fn verify_against(&self, nodes: &[SignedNode]) -> Vec<String> {
        let payload = match &self.data {
            Some(payload) => payload,
            None => return vec!["<malformed payload>".to_string()],
        };

        let mut failures = Vec::new();
        for entry in &payload.entries {
            let id = match NodeId::from_str(&entry.id) {
                Ok(id) => id,
                Err(_) => {
                    failures.push(entry.id.clone());
                    continue;
                }
            };
            let node = nodes.iter().find(|node| node.id.as_ref() == Some(&id));
            let ok = match node {
                Some(node) => {
                    node.verify().is_ok()
                        && hex::encode(&node.signature) == entry.signature
                        && node.node.author.to_string() == entry.author
                }
                None => false,
            };
            if !ok {
                failures.push(entry.id.clone());
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_doc(mode: CapsuleMode, entries: Vec<CapsuleEntry>) -> String {
        let conversation =
            NodeId::digest(b"conv", braid_core_types::HashAlgorithm::Sha256).unwrap();
        let payload = CapsulePayload {
            conversation: conversation.to_string(),
            title: "test".to_string(),
            entries,
        };
        let json = serde_json::to_string_pretty(&payload).unwrap();
        format!(
            "{HEADER}\nmode: {}\npayload-sha256: {}\n{PAYLOAD_BEGIN}\n{json}\n{PAYLOAD_END}\n",
            mode.as_str(),
            hex::encode(Sha256::digest(json.as_bytes())),
        )
    }

    fn entry(id: &str) -> CapsuleEntry {
        CapsuleEntry {
            id: id.to_string(),
            role: "user".to_string(),
            content: "hello".to_string(),
            signature: "ab".repeat(64),
            author: "did:key:zExample".to_string(),
        }
    }

    #[test]
    fn import_reads_mode_and_payload() {
        let doc = payload_doc(CapsuleMode::Open, vec![entry("one")]);
        let imported = import(&doc);
        assert_eq!(imported.mode, Some(CapsuleMode::Open));
        assert!(imported.checksum_valid);
        assert_eq!(imported.data.unwrap().entries.len(), 1);
    }

    #[test]
    fn malformed_payload_yields_none_without_error() {
        let imported = import("BRAID CAPSULE v1\nmode: open\nno markers here");
        assert_eq!(imported.mode, Some(CapsuleMode::Open));
        assert!(imported.data.is_none());

        let garbled = format!(
            "{HEADER}\nmode: open\n{PAYLOAD_BEGIN}\nnot json\n{PAYLOAD_END}\n"
        );
        let imported = import(&garbled);
        assert!(imported.data.is_none());
    }

    #[test]
    fn private_mode_withholds_content() {
        let doc = payload_doc(CapsuleMode::Private, vec![entry("one")]);
        let rendered = import(&doc).render();
        assert_eq!(rendered.status, RenderStatus::Verified);
        assert!(rendered.lines.is_empty());
    }

    #[test]
    fn render_requires_author_and_signature() {
        let mut bad = entry("one");
        bad.signature = String::new();
        let doc = payload_doc(CapsuleMode::Open, vec![entry("zero"), bad]);
        let rendered = import(&doc).render();
        assert!(matches!(rendered.status, RenderStatus::Failed(_)));
        assert!(rendered.lines.is_empty());
    }

    #[test]
    fn tampered_payload_fails_checksum() {
        let doc = payload_doc(CapsuleMode::Open, vec![entry("one")]);
        let tampered = doc.replace("hello", "hijacked");
        let imported = import(&tampered);
        assert!(!imported.checksum_valid);
        assert!(matches!(imported.render().status, RenderStatus::Failed(_)));
    }
}
