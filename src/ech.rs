//! ECH configuration lookup.
//!
//! The ECHConfigList is published in the `ech` parameter (key 5) of the
//! HTTPS record (type 65) of a public domain. It is fetched once over
//! DNS-over-HTTPS at startup and cached for every dial.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::svcb::SvcParamValue;
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::ProtoError;
use parking_lot::RwLock;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::info;

use crate::{Error, Result};

const DNS_MESSAGE: &str = "application/dns-message";
const DOH_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait EchProvider: Send + Sync {
    /// Fetch (or refresh) the ECH config. Called once before serving.
    async fn prepare(&self) -> Result<()>;

    /// Raw ECHConfigList from the last successful `prepare`.
    fn config_list(&self) -> Option<Vec<u8>>;
}

pub struct DohEchProvider {
    domain: String,
    doh_url: String,
    client: reqwest::Client,
    cached: RwLock<Option<Vec<u8>>>,
}

impl DohEchProvider {
    /// `dns_server` may omit the scheme, `https://` is assumed.
    pub fn new(domain: &str, dns_server: &str) -> Result<Self> {
        let doh_url = if dns_server.contains("://") {
            dns_server.to_string()
        } else {
            format!("https://{dns_server}")
        };
        let client = reqwest::Client::builder().timeout(DOH_TIMEOUT).build()?;
        Ok(Self {
            domain: domain.to_string(),
            doh_url,
            client,
            cached: RwLock::new(None),
        })
    }

    async fn query(&self) -> Result<Vec<u8>> {
        let body = self
            .client
            .post(&self.doh_url)
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .body(build_query(&self.domain, RecordType::HTTPS)?)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        parse_ech_config(&body)
    }
}

#[async_trait]
impl EchProvider for DohEchProvider {
    async fn prepare(&self) -> Result<()> {
        let config = self.query().await?;
        info!(domain = %self.domain, bytes = config.len(), "ech config loaded");
        *self.cached.write() = Some(config);
        Ok(())
    }

    fn config_list(&self) -> Option<Vec<u8>> {
        self.cached.read().clone()
    }
}

/// DNS wire-format query with recursion desired and id 0.
pub fn build_query(domain: &str, qtype: RecordType) -> Result<Vec<u8>> {
    let name = Name::from_str(domain)
        .map_err(|e| Error::Ech(format!("invalid domain {domain:?}: {e}")))?;

    let mut message = Message::new();
    message
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, qtype));
    message.to_vec().map_err(dns_error)
}

/// Pull the ECHConfigList out of the first HTTPS answer carrying one.
pub fn parse_ech_config(response: &[u8]) -> Result<Vec<u8>> {
    let message = Message::from_vec(response).map_err(dns_error)?;
    if message.response_code() != ResponseCode::NoError {
        return Err(Error::Ech(format!("dns rcode {}", message.response_code())));
    }

    message
        .answers()
        .iter()
        .filter_map(|answer| match answer.data() {
            RData::HTTPS(https) => https.0.svc_params().iter().find_map(|(_, value)| match value {
                SvcParamValue::EchConfigList(list) => Some(list.0.clone()),
                _ => None,
            }),
            _ => None,
        })
        .next()
        .ok_or_else(|| Error::Ech("no ech parameter in HTTPS answer".into()))
}

fn dns_error(e: ProtoError) -> Error {
    Error::Ech(format!("dns message: {e}"))
}
