//! Cloud-init seed image builder.
//!
//! Serializes the user-data, meta-data and network-config documents and
//! packs them into an ISO-9660 image labelled `cidata`, the volume the
//! guest's cloud-init agent scans for on first boot.

pub mod iso;

use crate::error::{ProvisionError, Result};
use chrono::{DateTime, Utc};
use iso::IsoWriter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use tracing::debug;

/// Volume label cloud-init's NoCloud datasource looks for.
pub const VOLUME_ID: &str = "cidata";

/// Header line cloud-init requires at the top of user-data.
pub const USER_DATA_HEADER: &str = "#cloud-config\n";

pub const USER_DATA_FILE: &str = "user-data";
pub const META_DATA_FILE: &str = "meta-data";
pub const NETWORK_CONFIG_FILE: &str = "network-config";

/// `#cloud-config` user-data document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<User>,

    /// Allow SSH password authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_pwauth: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runcmd: Vec<String>,
}

impl UserData {
    /// Single sudo-capable login with the given keys and optional password hash.
    pub fn for_login(
        login: impl Into<String>,
        ssh_keys: Vec<String>,
        password_hash: Option<String>,
    ) -> Self {
        let ssh_pwauth = password_hash.as_ref().map(|_| true);
        Self {
            hostname: None,
            users: vec![User {
                name: login.into(),
                passwd: password_hash,
                lock_passwd: Some(false),
                ssh_authorized_keys: ssh_keys,
                sudo: Some("ALL=(ALL) NOPASSWD:ALL".to_string()),
                groups: Some("sudo".to_string()),
                shell: Some("/bin/bash".to_string()),
            }],
            ssh_pwauth,
            packages: Vec::new(),
            runcmd: Vec::new(),
        }
    }

    /// Serialized document, header included.
    pub fn render(&self) -> Result<String> {
        let body = serde_yaml::to_string(self).map_err(|e| ProvisionError::Serialization {
            document: USER_DATA_FILE,
            reason: e.to_string(),
        })?;
        Ok(format!("{}{}", USER_DATA_HEADER, body))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub name: String,

    /// Pre-hashed password (crypt format). Never plaintext.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passwd: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_passwd: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_authorized_keys: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sudo: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

/// NoCloud meta-data document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetaData {
    pub instance_id: String,
    pub local_hostname: String,
}

impl MetaData {
    pub fn new(instance_id: impl ToString, hostname: impl Into<String>) -> Self {
        Self { instance_id: instance_id.to_string(), local_hostname: hostname.into() }
    }

    pub fn render(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| ProvisionError::Serialization {
            document: META_DATA_FILE,
            reason: e.to_string(),
        })
    }
}

/// Netplan-style (version 2) network-config document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub version: u8,
    pub ethernets: BTreeMap<String, Ethernet>,
}

impl NetworkConfig {
    /// One interface, matched by name pattern, configured by DHCP.
    pub fn dhcp(interface: impl Into<String>) -> Self {
        Self::single(interface, Ethernet::dhcp())
    }

    /// One interface with a static address in CIDR notation.
    pub fn fixed(
        interface: impl Into<String>,
        address: impl Into<String>,
        gateway: Option<String>,
        nameservers: Vec<String>,
    ) -> Self {
        Self::single(interface, Ethernet::fixed(address, gateway, nameservers))
    }

    fn single(interface: impl Into<String>, ethernet: Ethernet) -> Self {
        let mut ethernets = BTreeMap::new();
        ethernets.insert(interface.into(), ethernet);
        Self { version: 2, ethernets }
    }

    pub fn render(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| ProvisionError::Serialization {
            document: NETWORK_CONFIG_FILE,
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ethernet {
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub match_: Option<InterfaceMatch>,

    pub dhcp4: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway4: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<Nameservers>,
}

impl Ethernet {
    /// Guest NICs on the virtio bus enumerate as `en*`.
    fn virtio_match() -> Option<InterfaceMatch> {
        Some(InterfaceMatch { name: Some("en*".to_string()), macaddress: None })
    }

    pub fn dhcp() -> Self {
        Self { match_: Self::virtio_match(), dhcp4: true, ..Default::default() }
    }

    pub fn fixed(address: impl Into<String>, gateway: Option<String>, dns: Vec<String>) -> Self {
        Self {
            match_: Self::virtio_match(),
            dhcp4: false,
            addresses: vec![address.into()],
            gateway4: gateway,
            nameservers: (!dns.is_empty()).then_some(Nameservers { addresses: dns }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macaddress: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Nameservers {
    pub addresses: Vec<String>,
}

/// Builds `cidata` seed images.
#[derive(Debug, Clone, Default)]
pub struct CloudInitImage {
    timestamp: Option<DateTime<Utc>>,
}

impl CloudInitImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the image timestamps, making output reproducible.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Serialize the documents and return the image bytes.
    pub fn build(
        &self,
        user_data: &UserData,
        meta_data: &MetaData,
        network_config: Option<&NetworkConfig>,
    ) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.build_to(user_data, meta_data, network_config, &mut buf)?;
        Ok(buf)
    }

    /// Serialize the documents and stream the image into `out`.
    pub fn build_to<W: Write>(
        &self,
        user_data: &UserData,
        meta_data: &MetaData,
        network_config: Option<&NetworkConfig>,
        out: &mut W,
    ) -> Result<()> {
        let user = user_data.render()?;
        let meta = meta_data.render()?;
        let network = network_config.map(NetworkConfig::render).transpose()?;
        self.build_raw_to(
            user.as_bytes(),
            meta.as_bytes(),
            network.as_ref().map(|n| n.as_bytes()),
            out,
        )
    }

    /// Pack pre-rendered documents, skipping serialization.
    ///
    /// `user_data` is written as given; callers wanting cloud-config must
    /// include the header themselves.
    pub fn build_raw(
        &self,
        user_data: &[u8],
        meta_data: &[u8],
        network_config: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.build_raw_to(user_data, meta_data, network_config, &mut buf)?;
        Ok(buf)
    }

    pub fn build_raw_to<W: Write>(
        &self,
        user_data: &[u8],
        meta_data: &[u8],
        network_config: Option<&[u8]>,
        out: &mut W,
    ) -> Result<()> {
        let mut writer = IsoWriter::new(VOLUME_ID);
        if let Some(ts) = self.timestamp {
            writer = writer.with_timestamp(ts);
        }
        writer.add_file(USER_DATA_FILE, user_data)?;
        writer.add_file(META_DATA_FILE, meta_data)?;
        if let Some(network) = network_config {
            writer.add_file(NETWORK_CONFIG_FILE, network)?;
        }
        writer.write_to(out)?;
        debug!(
            user_data_bytes = user_data.len(),
            meta_data_bytes = meta_data.len(),
            network_config = network_config.is_some(),
            "Built cloud-init image"
        );
        Ok(())
    }
}
