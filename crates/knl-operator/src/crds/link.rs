//! Links and connectors of a lab

use crate::error::{Error, Result};
use ipnet::IpNet;
use macaddr::MacAddr6;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static DNS_LABEL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$")
        .expect("valid DNS label regex (verified by tests)")
});

/// Check that `name` can be embedded in object names (DNS-1123 label).
pub fn validate_dns_label(what: &str, name: &str) -> Result<()> {
    if name.len() > 63 || !DNS_LABEL_REGEX.is_match(name) {
        return Err(Error::validation(format!(
            "{what} name {name:?} is not a valid DNS-1123 label"
        )));
    }
    Ok(())
}

/// A shared broadcast domain connecting two or more node connectors.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    /// Attachment points, in order. The position determines the spoke name.
    #[serde(rename = "nodes")]
    pub connectors: Vec<Connector>,

    /// Gateway prefix for the link, e.g. `192.168.1.254/24`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw_addr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u16>,
}

/// A node's attachment point on a link.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Connector {
    pub node: String,

    /// Port or slot identifier, interpreted by the node kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,

    /// Interface prefix, e.g. `2001:db8::1/64`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

impl Link {
    /// Structural checks against the set of declared nodes.
    pub fn validate<V>(&self, link_name: &str, nodes: &BTreeMap<String, V>) -> Result<()> {
        validate_dns_label("link", link_name)?;
        if self.connectors.len() < 2 {
            return Err(Error::validation(format!(
                "link {link_name} needs at least 2 connectors, got {}",
                self.connectors.len()
            )));
        }
        if let Some(gw) = &self.gw_addr {
            parse_prefix(gw).map_err(|e| {
                Error::validation(format!("link {link_name} gateway address {e}"))
            })?;
        }
        for (i, connector) in self.connectors.iter().enumerate() {
            connector
                .validate(nodes)
                .map_err(|e| Error::validation(format!("link {link_name} connector {i}: {e}")))?;
        }
        Ok(())
    }
}

impl Connector {
    fn validate<V>(&self, nodes: &BTreeMap<String, V>) -> std::result::Result<(), String> {
        if !nodes.contains_key(&self.node) {
            return Err(format!("node {} is not declared", self.node));
        }
        if let Some(addr) = &self.addr {
            parse_prefix(addr).map_err(|e| format!("address {e}"))?;
        }
        if let Some(mac) = &self.mac {
            mac.parse::<MacAddr6>()
                .map_err(|_| format!("{mac:?} is not a valid MAC address"))?;
        }
        Ok(())
    }
}

fn parse_prefix(value: &str) -> std::result::Result<IpNet, String> {
    value
        .parse::<IpNet>()
        .map_err(|_| format!("{value:?} is not a valid prefix"))
}
