//! Online roster: source model and the fetch client.
//!
//! The roster service is an external collaborator; we only care about its
//! interface: a JSON array of online sources, refreshed wholesale each cycle.
//! The site-specific details of how that service scrapes its upstream are
//! not our problem.

use anyhow::{Context, Result};
use async_trait::async_trait;
use corralconf::RosterConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Online state of a source, decoded from the service's raw `vs` codes.
///
/// Only public feeds are capturable; away/private/unknown states are visible
/// in the roster but never recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum OnlineState {
    /// Publicly streaming (`0`).
    Public,
    /// Public mobile feed (`90`), still capturable.
    PublicMobile,
    /// Away from the stream (`2`).
    Away,
    /// In a private or group show (`12`, `13`).
    Private,
    /// Offline (`127`).
    Offline,
    /// A code this build does not know about. Carried through untouched.
    Unknown(i64),
}

impl OnlineState {
    /// Whether a capture process can be pointed at this source right now.
    pub fn capturable(self) -> bool {
        matches!(self, OnlineState::Public | OnlineState::PublicMobile)
    }
}

impl From<i64> for OnlineState {
    fn from(code: i64) -> Self {
        match code {
            0 => OnlineState::Public,
            90 => OnlineState::PublicMobile,
            2 => OnlineState::Away,
            12 | 13 => OnlineState::Private,
            127 => OnlineState::Offline,
            other => OnlineState::Unknown(other),
        }
    }
}

impl From<OnlineState> for i64 {
    fn from(state: OnlineState) -> Self {
        match state {
            OnlineState::Public => 0,
            OnlineState::PublicMobile => 90,
            OnlineState::Away => 2,
            OnlineState::Private => 12,
            OnlineState::Offline => 127,
            OnlineState::Unknown(other) => other,
        }
    }
}

/// Server/region attributes the capture backends need to build a command
/// line. Opaque to the supervisor itself; unknown keys are carried in
/// `extra` so a snapshot round-trips losslessly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceAttrs {
    /// Edge server number the stream is assigned to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camserv: Option<u32>,

    /// Streaming phase/protocol marker (`"a"` selects the protocol-dump
    /// backend).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One remote source as reported by the roster service.
///
/// Refreshed wholesale each cycle; never partially mutated. Derived fields
/// (current mode, resolved directory name) live in the inclusion store and
/// are joined back in by identifier, not stored here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    /// Stable numeric identifier.
    pub uid: u64,

    /// Display name.
    #[serde(rename = "nm")]
    pub name: String,

    /// Online state (`vs` on the wire).
    #[serde(rename = "vs")]
    pub state: OnlineState,

    #[serde(flatten)]
    pub attrs: SourceAttrs,
}

/// Fetches the current roster snapshot.
///
/// Trait seam so the supervisor loop can be driven by a canned roster in
/// tests.
#[async_trait]
pub trait RosterFetch: Send + Sync {
    async fn fetch(&self) -> Result<Vec<Source>>;
}

/// HTTP client for the roster service.
pub struct RosterClient {
    client: Client,
    url: String,
}

impl RosterClient {
    pub fn new(config: &RosterConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create roster HTTP client")?;

        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl RosterFetch for RosterClient {
    async fn fetch(&self) -> Result<Vec<Source>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("Failed to connect to roster service")?;

        if !response.status().is_success() {
            anyhow::bail!("Roster service returned status {}", response.status());
        }

        response
            .json()
            .await
            .context("Failed to parse roster response")
    }
}
