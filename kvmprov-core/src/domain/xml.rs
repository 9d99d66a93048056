//! libvirt domain XML model.
//!
//! Only the elements kvmprov writes or reads back are modelled; anything else
//! in a live description (aliases, PCI addresses, controllers, seclabels) is
//! ignored on parse. Attribute fields come first in every struct so that
//! serialization emits them before child elements.

use crate::error::{ProvisionError, Result};
use crate::paths::StorageLayout;
use crate::types::{Cpu, DomainSpec, Memory, MemoryUnit, Os};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Lifecycle action for poweroff, reboot and crash.
const LIFECYCLE_ACTION: &str = "destroy";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "domain")]
pub struct DomainXml {
    #[serde(rename = "@type")]
    pub kind: String,

    pub name: String,

    pub uuid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub memory: MemoryXml,

    pub vcpu: VcpuXml,

    pub os: OsXml,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuXml>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<ClockXml>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_poweroff: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_reboot: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_crash: Option<String>,

    #[serde(default)]
    pub devices: DevicesXml,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryXml {
    /// libvirt defaults to KiB when the attribute is absent.
    #[serde(rename = "@unit", default = "default_memory_unit")]
    pub unit: String,

    #[serde(rename = "$text")]
    pub value: u64,
}

fn default_memory_unit() -> String {
    "KiB".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VcpuXml {
    #[serde(rename = "@placement", default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<String>,

    #[serde(rename = "$text")]
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsXml {
    #[serde(rename = "type")]
    pub os_type: OsTypeXml,

    #[serde(rename = "boot", default, skip_serializing_if = "Vec::is_empty")]
    pub boot: Vec<BootXml>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsTypeXml {
    #[serde(rename = "@arch", default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,

    #[serde(rename = "@machine", default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,

    #[serde(rename = "$text")]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootXml {
    #[serde(rename = "@dev")]
    pub dev: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuXml {
    #[serde(rename = "@mode", default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockXml {
    #[serde(rename = "@offset")]
    pub offset: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DevicesXml {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emulator: Option<String>,

    #[serde(rename = "disk", default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskXml>,

    #[serde(rename = "interface", default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<InterfaceXml>,

    #[serde(rename = "serial", default, skip_serializing_if = "Vec::is_empty")]
    pub serials: Vec<CharDeviceXml>,

    #[serde(rename = "console", default, skip_serializing_if = "Vec::is_empty")]
    pub consoles: Vec<CharDeviceXml>,

    #[serde(rename = "graphics", default, skip_serializing_if = "Vec::is_empty")]
    pub graphics: Vec<GraphicsXml>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskXml {
    #[serde(rename = "@type")]
    pub kind: String,

    #[serde(rename = "@device")]
    pub device: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<DriverXml>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<DiskSourceXml>,

    pub target: TargetXml,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<Flag>,
}

/// Presence-only element such as `<readonly/>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Flag {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverXml {
    #[serde(rename = "@name")]
    pub name: String,

    #[serde(rename = "@type")]
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSourceXml {
    #[serde(rename = "@file", default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetXml {
    #[serde(rename = "@dev")]
    pub dev: String,

    #[serde(rename = "@bus", default, skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceXml {
    #[serde(rename = "@type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacXml>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<InterfaceSourceXml>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelXml>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacXml {
    #[serde(rename = "@address")]
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSourceXml {
    #[serde(rename = "@network", default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    #[serde(rename = "@bridge", default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelXml {
    #[serde(rename = "@type")]
    pub kind: String,
}

/// `<serial>` and `<console>` share this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharDeviceXml {
    #[serde(rename = "@type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<CharTargetXml>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharTargetXml {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(rename = "@port", default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphicsXml {
    #[serde(rename = "@type")]
    pub kind: String,

    #[serde(rename = "@port", default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    #[serde(rename = "@autoport", default, skip_serializing_if = "Option::is_none")]
    pub autoport: Option<String>,

    #[serde(rename = "@listen", default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
}

impl DomainXml {
    /// Full description of a new domain whose disk image is in `image_format`.
    pub fn from_spec(
        spec: &DomainSpec,
        layout: &StorageLayout,
        network: &str,
        image_format: &str,
    ) -> Self {
        let id = spec.id.to_string();
        let memory = spec.memory.normalized();
        Self {
            kind: "kvm".to_string(),
            name: id.clone(),
            uuid: id,
            title: Some(spec.name.clone()),
            description: Some(encode_description(&spec.os.name, spec.storage_gib)),
            memory: MemoryXml { unit: MemoryUnit::MiB.as_str().to_string(), value: memory.value },
            vcpu: VcpuXml { placement: Some("static".to_string()), count: spec.cpu.cores },
            os: OsXml {
                os_type: OsTypeXml {
                    arch: Some(spec.os.arch.clone()),
                    machine: None,
                    value: spec.os.os_type.clone(),
                },
                boot: vec![BootXml { dev: "hd".to_string() }],
            },
            cpu: Some(CpuXml { mode: Some("host-passthrough".to_string()) }),
            clock: Some(ClockXml { offset: "utc".to_string() }),
            on_poweroff: Some(LIFECYCLE_ACTION.to_string()),
            on_reboot: Some(LIFECYCLE_ACTION.to_string()),
            on_crash: Some(LIFECYCLE_ACTION.to_string()),
            devices: DevicesXml {
                emulator: None,
                disks: vec![
                    DiskXml::virtio_disk(&spec.vm_image_path(layout), image_format),
                    DiskXml::sata_cdrom(&spec.cloudinit_iso_path(layout)),
                ],
                interfaces: vec![InterfaceXml::virtio_network(network)],
                serials: vec![CharDeviceXml::pty(None)],
                consoles: vec![CharDeviceXml::pty(Some("serial"))],
                graphics: vec![GraphicsXml::vnc_any()],
            },
        }
    }

    /// Reconstruct the spec from a (possibly live) description.
    pub fn to_spec(&self) -> Result<DomainSpec> {
        let id = Uuid::parse_str(self.uuid.trim()).map_err(|e| {
            ProvisionError::invalid_input(format!("domain uuid '{}': {}", self.uuid, e))
        })?;
        let unit = MemoryUnit::parse(&self.memory.unit).ok_or_else(|| {
            ProvisionError::invalid_input(format!("unknown memory unit '{}'", self.memory.unit))
        })?;
        let (os_name, storage_gib) =
            self.description.as_deref().map(decode_description).unwrap_or_default();

        Ok(DomainSpec {
            id,
            name: self.title.clone().unwrap_or_else(|| self.name.clone()),
            memory: Memory { value: self.memory.value, unit }.normalized(),
            cpu: Cpu { cores: self.vcpu.count },
            os: Os {
                name: os_name,
                os_type: self.os.os_type.value.clone(),
                arch: self.os.os_type.arch.clone().unwrap_or_default(),
            },
            storage_gib,
        })
    }

    pub fn parse(xml: &str) -> Result<Self> {
        quick_xml::de::from_str(xml)
            .map_err(|e| ProvisionError::invalid_input(format!("malformed domain XML: {}", e)))
    }

    pub fn to_xml(&self) -> Result<String> {
        quick_xml::se::to_string(self).map_err(|e| ProvisionError::Serialization {
            document: "domain XML",
            reason: e.to_string(),
        })
    }

    /// MAC address of the first interface, if libvirt assigned one.
    pub fn primary_mac(&self) -> Option<&str> {
        self.devices.interfaces.first()?.mac.as_ref().map(|m| m.address.as_str())
    }

    /// Pin the first interface to `address` so a redefinition keeps the guest NIC.
    pub fn set_primary_mac(&mut self, address: &str) {
        if let Some(iface) = self.devices.interfaces.first_mut() {
            iface.mac = Some(MacXml { address: address.to_string() });
        }
    }
}

impl DiskXml {
    fn virtio_disk(image: &Path, format: &str) -> Self {
        Self {
            kind: "file".to_string(),
            device: "disk".to_string(),
            driver: Some(DriverXml { name: "qemu".to_string(), format: format.to_string() }),
            source: Some(DiskSourceXml { file: Some(image.display().to_string()) }),
            target: TargetXml { dev: "vda".to_string(), bus: Some("virtio".to_string()) },
            readonly: None,
        }
    }

    fn sata_cdrom(iso: &Path) -> Self {
        Self {
            kind: "file".to_string(),
            device: "cdrom".to_string(),
            driver: Some(DriverXml { name: "qemu".to_string(), format: "raw".to_string() }),
            source: Some(DiskSourceXml { file: Some(iso.display().to_string()) }),
            target: TargetXml { dev: "sda".to_string(), bus: Some("sata".to_string()) },
            readonly: Some(Flag {}),
        }
    }
}

impl InterfaceXml {
    fn virtio_network(network: &str) -> Self {
        Self {
            kind: "network".to_string(),
            mac: None,
            source: Some(InterfaceSourceXml { network: Some(network.to_string()), bridge: None }),
            model: Some(ModelXml { kind: "virtio".to_string() }),
        }
    }
}

impl CharDeviceXml {
    fn pty(target_type: Option<&str>) -> Self {
        Self {
            kind: "pty".to_string(),
            target: Some(CharTargetXml { kind: target_type.map(str::to_string), port: Some(0) }),
        }
    }
}

impl GraphicsXml {
    fn vnc_any() -> Self {
        Self {
            kind: "vnc".to_string(),
            port: Some(-1),
            autoport: Some("yes".to_string()),
            listen: Some("0.0.0.0".to_string()),
        }
    }
}

fn encode_description(os_name: &str, storage_gib: u32) -> String {
    format!("os={};storage_gib={}", os_name, storage_gib)
}

/// Inverse of [`encode_description`]; unknown keys are ignored.
fn decode_description(text: &str) -> (String, u32) {
    let mut os = String::new();
    let mut storage = 0;
    for pair in text.split(';') {
        match pair.trim().split_once('=') {
            Some(("os", v)) => os = v.to_string(),
            Some(("storage_gib", v)) => storage = v.parse().unwrap_or(0),
            _ => {}
        }
    }
    (os, storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> DomainSpec {
        DomainSpec {
            id: Uuid::parse_str("6f1c1b8e-3c44-4d8a-9a43-0b8f0f6f2a11").unwrap(),
            name: "web-1".to_string(),
            memory: Memory::mib(2048),
            cpu: Cpu { cores: 2 },
            os: Os::hvm("ubuntu", "x86_64"),
            storage_gib: 20,
        }
    }

    #[test]
    fn test_generated_description_contract() {
        let layout = StorageLayout::under("/srv/kvm");
        let xml = DomainXml::from_spec(&spec(), &layout, "default", "qcow2").to_xml().unwrap();

        assert!(xml.starts_with(r#"<domain type="kvm">"#));
        assert!(xml.contains("<name>6f1c1b8e-3c44-4d8a-9a43-0b8f0f6f2a11</name>"));
        assert!(xml.contains("<uuid>6f1c1b8e-3c44-4d8a-9a43-0b8f0f6f2a11</uuid>"));
        assert!(xml.contains(r#"<memory unit="MiB">2048</memory>"#));
        assert!(xml.contains(r#"<vcpu placement="static">2</vcpu>"#));
        assert!(xml.contains(r#"<type arch="x86_64">hvm</type>"#));
        assert!(xml.contains(r#"<cpu mode="host-passthrough"/>"#));
        assert!(xml.contains(r#"<clock offset="utc"/>"#));
        assert!(xml.contains("<on_poweroff>destroy</on_poweroff>"));
        assert!(xml.contains("<on_reboot>destroy</on_reboot>"));
        assert!(xml.contains("<on_crash>destroy</on_crash>"));
        assert!(xml.contains(r#"<driver name="qemu" type="qcow2"/>"#));
        assert!(xml.contains(
            r#"<source file="/srv/kvm/images/6f1c1b8e-3c44-4d8a-9a43-0b8f0f6f2a11.img"/><target dev="vda" bus="virtio"/>"#
        ));
        assert!(xml.contains(
            r#"<source file="/srv/kvm/cloudinit/cloudinit_6f1c1b8e-3c44-4d8a-9a43-0b8f0f6f2a11.iso"/><target dev="sda" bus="sata"/><readonly/>"#
        ));
        assert!(xml.contains(r#"<source network="default"/><model type="virtio"/>"#));
        assert!(xml.contains(r#"<graphics type="vnc" port="-1" autoport="yes" listen="0.0.0.0"/>"#));
        assert!(xml.contains(r#"<serial type="pty"><target port="0"/></serial>"#));
        assert!(xml.contains(r#"<console type="pty"><target type="serial" port="0"/></console>"#));
    }

    #[test]
    fn test_disk_driver_follows_image_format() {
        let layout = StorageLayout::under("/srv/kvm");
        let xml = DomainXml::from_spec(&spec(), &layout, "default", "raw").to_xml().unwrap();
        assert!(xml.contains(r#"<driver name="qemu" type="raw"/>"#));
        assert!(!xml.contains("qcow2"));
    }

    #[test]
    fn test_spec_survives_generation_and_parse() {
        let layout = StorageLayout::under("/srv/kvm");
        let xml = DomainXml::from_spec(&spec(), &layout, "default", "qcow2").to_xml().unwrap();
        assert_eq!(DomainXml::parse(&xml).unwrap().to_spec().unwrap(), spec());
    }

    #[test]
    fn test_parse_live_description() {
        let live = r#"
<domain type='kvm' id='7'>
  <name>6f1c1b8e-3c44-4d8a-9a43-0b8f0f6f2a11</name>
  <uuid>6f1c1b8e-3c44-4d8a-9a43-0b8f0f6f2a11</uuid>
  <title>web-1</title>
  <description>os=ubuntu;storage_gib=20</description>
  <memory unit='KiB'>4194304</memory>
  <currentMemory unit='KiB'>4194304</currentMemory>
  <vcpu placement='static'>4</vcpu>
  <resource><partition>/machine</partition></resource>
  <os>
    <type arch='x86_64' machine='pc-q35-8.2'>hvm</type>
    <boot dev='hd'/>
  </os>
  <cpu mode='host-passthrough' check='none' migratable='on'/>
  <clock offset='utc'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>destroy</on_reboot>
  <on_crash>destroy</on_crash>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/srv/kvm/images/6f1c1b8e-3c44-4d8a-9a43-0b8f0f6f2a11.img' index='2'/>
      <backingStore/>
      <target dev='vda' bus='virtio'/>
      <alias name='virtio-disk0'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='/srv/kvm/cloudinit/cloudinit_6f1c1b8e-3c44-4d8a-9a43-0b8f0f6f2a11.iso' index='1'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    <controller type='usb' index='0' model='qemu-xhci'/>
    <interface type='network'>
      <mac address='52:54:00:12:34:56'/>
      <source network='default' portid='abc' bridge='virbr0'/>
      <target dev='vnet3'/>
      <model type='virtio'/>
    </interface>
    <serial type='pty'>
      <source path='/dev/pts/4'/>
      <target type='isa-serial' port='0'><model name='isa-serial'/></target>
    </serial>
    <console type='pty' tty='/dev/pts/4'>
      <target type='serial' port='0'/>
    </console>
    <graphics type='vnc' port='5900' autoport='yes' listen='0.0.0.0'>
      <listen type='address' address='0.0.0.0'/>
    </graphics>
  </devices>
</domain>"#;

        let parsed = DomainXml::parse(live).unwrap();
        let spec = parsed.to_spec().unwrap();

        assert_eq!(spec.memory, Memory::mib(4096));
        assert_eq!(spec.cpu.cores, 4);
        assert_eq!(spec.os, Os::hvm("ubuntu", "x86_64"));
        assert_eq!(spec.storage_gib, 20);
        assert_eq!(spec.name, "web-1");
        assert_eq!(parsed.devices.disks.len(), 2);
        assert_eq!(parsed.primary_mac(), Some("52:54:00:12:34:56"));
    }

    #[test]
    fn test_foreign_description_defaults() {
        let xml = r#"<domain type='kvm'><name>x</name><uuid>6f1c1b8e-3c44-4d8a-9a43-0b8f0f6f2a11</uuid>
<memory>1048576</memory><vcpu>1</vcpu><os><type>hvm</type></os></domain>"#;
        let spec = DomainXml::parse(xml).unwrap().to_spec().unwrap();
        assert_eq!(spec.memory, Memory::mib(1024));
        assert_eq!(spec.name, "x");
        assert_eq!(spec.os.name, "");
        assert_eq!(spec.storage_gib, 0);
    }

    #[test]
    fn test_malformed_xml_is_invalid_input() {
        assert!(DomainXml::parse("<domain><name>").is_err());
    }
}
