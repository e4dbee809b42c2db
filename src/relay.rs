use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Port of the hub's HTTP API when the address doesn't name one.
const DEFAULT_HUB_PORT: u16 = 4444;
const HUB_TIMEOUT: Duration = Duration::from_secs(2);

/// A single relay endpoint.
pub trait Relay: fmt::Debug {
    /// The logical name configured on the relay.
    fn name(&self) -> &str;

    /// Closes the relay `delay_ms` from now and opens it again `duration_ms`
    /// later. Fire and forget: the relay runs the timing itself.
    fn delayed_pulse(&self, delay_ms: u32, duration_ms: u32) -> Result<()>;
}

/// Something that can enumerate relays.
pub trait RelayHub {
    fn relays(&self) -> Result<Vec<Box<dyn Relay>>>;
}

/// A Yoctopuce hub reached over its HTTP API.
pub struct YoctoHub {
    client: Client,
    base_url: String,
}

/// One relay function listed by the hub.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YellowPageEntry {
    /// `<serial>.<function>`, e.g. `RELAYHI1-1A2B3.relay4`
    hardware_id: String,
    #[serde(default)]
    logical_name: String,
}

#[derive(Debug, Deserialize)]
struct YellowPages {
    #[serde(rename = "Relay", default)]
    relays: Vec<YellowPageEntry>,
}

/// A relay function on a module behind a [`YoctoHub`].
pub struct YoctoRelay {
    client: Client,
    url: String,
    name: String,
}

impl fmt::Debug for YoctoRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YoctoRelay").field("name", &self.name).field("url", &self.url).finish()
    }
}

/// Turns a bare host (`192.168.1.71`) or host:port into the hub's base URL.
pub fn hub_base_url(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else if address.contains(':') {
        format!("http://{}", address)
    } else {
        format!("http://{}:{}", address, DEFAULT_HUB_PORT)
    }
}

impl YoctoHub {
    pub fn connect(address: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(HUB_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        let base_url = hub_base_url(address);
        log::info!("Connecting to hub at {}", base_url);
        Ok(Self { client, base_url })
    }
}

impl RelayHub for YoctoHub {
    fn relays(&self) -> Result<Vec<Box<dyn Relay>>> {
        let url = format!("{}/api/services/yellowPages.json", self.base_url);
        let body = self
            .client
            .get(&url)
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.text())
            .with_context(|| format!("Hub unreachable at {}", self.base_url))?;
        let relays = parse_yellow_pages(&self.client, &self.base_url, &body)?;
        Ok(relays.into_iter().map(|r| Box::new(r) as Box<dyn Relay>).collect())
    }
}

fn parse_yellow_pages(client: &Client, base_url: &str, body: &str) -> Result<Vec<YoctoRelay>> {
    let pages: YellowPages = serde_json::from_str(body).context("Malformed yellow pages from hub")?;
    pages
        .relays
        .into_iter()
        .map(|entry| {
            let (serial, function) = entry
                .hardware_id
                .split_once('.')
                .ok_or_else(|| anyhow!("Bad hardware id '{}'", entry.hardware_id))?;
            Ok(YoctoRelay {
                client: client.clone(),
                url: format!("{}/bySerial/{}/api/{}", base_url, serial, function),
                name: entry.logical_name,
            })
        })
        .collect()
}

impl Relay for YoctoRelay {
    fn name(&self) -> &str {
        &self.name
    }

    fn delayed_pulse(&self, delay_ms: u32, duration_ms: u32) -> Result<()> {
        self.client
            .get(&self.url)
            .query(&[("delayedPulseTimer", format!("{}:{}", delay_ms, duration_ms))])
            .send()
            .and_then(|response| response.error_for_status())
            .with_context(|| format!("Pulse on {} failed", self.name))?;
        Ok(())
    }
}
