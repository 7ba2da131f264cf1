//! libvirt domain XML generation and parsing of `virsh` output.

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::types::VmConfig;

/// fw_cfg entry the guest reads its bootstrap payload from.
pub const BOOTSTRAP_FW_CFG: &str = "opt/io.vdesk/bootstrap";

/// Builder for libvirt domain XML.
pub struct DomainXmlBuilder<'a> {
    config: &'a VmConfig,
    disk_path: &'a str,
    mac: &'a str,
    network: &'a str,
}

impl<'a> DomainXmlBuilder<'a> {
    pub fn new(config: &'a VmConfig, disk_path: &'a str, mac: &'a str, network: &'a str) -> Self {
        Self {
            config,
            disk_path,
            mac,
            network,
        }
    }

    /// Build the domain XML string.
    pub fn build(&self) -> String {
        let mut xml = String::new();

        xml.push_str(&format!(
            r#"<domain type='kvm'>
  <name>{}</name>
  <memory unit='GiB'>{}</memory>
  <vcpu placement='static'>{}</vcpu>
"#,
            escape(&self.config.name),
            self.config.memory_gb,
            self.config.cpu_cores
        ));

        xml.push_str(&self.build_metadata());
        xml.push_str(&self.build_sysinfo());

        xml.push_str(
            r#"  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-model' check='partial'/>
  <clock offset='utc'>
    <timer name='rtc' tickpolicy='catchup'/>
    <timer name='pit' tickpolicy='delay'/>
    <timer name='hpet' present='no'/>
  </clock>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
"#,
        );

        xml.push_str("  <devices>\n");
        xml.push_str(&format!(
            r#"    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2' cache='none' io='native' discard='unmap'/>
      <source file='{}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
"#,
            escape(self.disk_path)
        ));
        xml.push_str(&format!(
            r#"    <interface type='network'>
      <source network='{}'/>
      <mac address='{}'/>
      <model type='virtio'/>
    </interface>
"#,
            escape(self.network),
            escape(self.mac)
        ));
        xml.push_str(
            r#"    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
    <channel type='unix'>
      <target type='virtio' name='org.qemu.guest_agent.0'/>
    </channel>
    <graphics type='spice' autoport='yes' listen='127.0.0.1'/>
    <video>
      <model type='qxl'/>
    </video>
"#,
        );
        xml.push_str("  </devices>\n");
        xml.push_str("</domain>\n");

        xml
    }

    fn build_metadata(&self) -> String {
        let network = match &self.config.network {
            Some(n) => n,
            None => return String::new(),
        };

        let mut xml = String::from(
            "  <metadata>\n    <vdesk:instance xmlns:vdesk='https://vdesk.io/xmlns/instance/1.0'>\n",
        );
        for (tag, value) in [
            ("vpc", &network.vpc),
            ("subnet", &network.subnet),
            ("address", &network.address),
        ] {
            if let Some(value) = value {
                xml.push_str(&format!("      <vdesk:{0}>{1}</vdesk:{0}>\n", tag, escape(value)));
            }
        }
        xml.push_str("    </vdesk:instance>\n  </metadata>\n");
        xml
    }

    fn build_sysinfo(&self) -> String {
        match &self.config.bootstrap {
            Some(payload) => format!(
                "  <sysinfo type='fwcfg'>\n    <entry name='{}'>{}</entry>\n  </sysinfo>\n",
                BOOTSTRAP_FW_CFG,
                escape(payload)
            ),
            None => String::new(),
        }
    }
}

/// MAC address of the first network interface in a domain's XML.
pub fn parse_interface_mac(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut in_interface = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"interface" => in_interface = true,
            Ok(Event::End(e)) if e.name().as_ref() == b"interface" => in_interface = false,
            Ok(Event::Empty(e)) | Ok(Event::Start(e)) if in_interface && e.name().as_ref() == b"mac" => {
                let attr = e.try_get_attribute("address").ok().flatten()?;
                return attr.unescape_value().ok().map(|v| v.into_owned());
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// A block device row from `virsh domblklist --details`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub target: String,
    pub source: String,
}

/// Parse `virsh domblklist --details` output.
pub fn parse_block_devices(output: &str) -> Vec<BlockDevice> {
    output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 4 || cols[0] == "Type" || cols[0].starts_with('-') {
                return None;
            }
            Some(BlockDevice {
                target: cols[2].to_string(),
                source: cols[3..].join(" "),
            })
        })
        .collect()
}

/// First unused virtio target name after the root disk.
pub fn next_free_target(devices: &[BlockDevice]) -> Option<String> {
    ('b'..='z')
        .map(|c| format!("vd{}", c))
        .find(|t| !devices.iter().any(|d| &d.target == t))
}

/// First IPv4 address in `virsh domifaddr` output.
pub fn parse_address(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|l| l.contains("ipv4"))
        .flat_map(|l| l.split_whitespace())
        .find_map(|tok| {
            let (addr, _prefix) = tok.split_once('/')?;
            addr.parse::<std::net::Ipv4Addr>().ok().map(|a| a.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NetworkConfig;

    #[test]
    fn test_build_escapes_and_carries_bootstrap() {
        let config = VmConfig::new("desk-01")
            .with_cpu(4)
            .with_memory_gb(8)
            .with_bootstrap("#!/bin/sh\necho '<ready>' && true")
            .with_network(NetworkConfig {
                vpc: Some("vpc-1".into()),
                address: Some("10.0.0.12".into()),
                ..Default::default()
            });
        let xml = DomainXmlBuilder::new(&config, "/var/lib/libvirt/images/desk-01-root.qcow2", "52:54:00:aa:bb:cc", "default")
            .build();

        assert!(xml.contains("<name>desk-01</name>"));
        assert!(xml.contains("<vcpu placement='static'>4</vcpu>"));
        assert!(xml.contains("<memory unit='GiB'>8</memory>"));
        assert!(xml.contains("<mac address='52:54:00:aa:bb:cc'/>"));
        assert!(xml.contains("&lt;ready&gt;"));
        assert!(xml.contains(BOOTSTRAP_FW_CFG));
        assert!(xml.contains("<vdesk:vpc>vpc-1</vdesk:vpc>"));
        assert!(!xml.contains("<vdesk:subnet>"));
    }

    #[test]
    fn test_parse_interface_mac() {
        let xml = r#"<domain type='kvm'>
  <name>desk-01</name>
  <devices>
    <disk type='file' device='disk'><target dev='vda' bus='virtio'/></disk>
    <interface type='network'>
      <mac address='52:54:00:12:34:56'/>
      <source network='default'/>
    </interface>
  </devices>
</domain>"#;
        assert_eq!(parse_interface_mac(xml).as_deref(), Some("52:54:00:12:34:56"));
        assert_eq!(parse_interface_mac("<domain/>"), None);
    }

    #[test]
    fn test_block_devices_and_next_target() {
        let out = " Type   Device   Target   Source\n\
                   ------------------------------------------------\n \
                   file   disk     vda      /var/lib/libvirt/images/desk-01-root.qcow2\n \
                   file   disk     vdb      /var/lib/vdesk/disks/disk-1.qcow2\n";
        let devices = parse_block_devices(out);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].target, "vdb");
        assert_eq!(devices[1].source, "/var/lib/vdesk/disks/disk-1.qcow2");
        assert_eq!(next_free_target(&devices).as_deref(), Some("vdc"));
    }

    #[test]
    fn test_parse_address() {
        let out = " Name       MAC address          Protocol     Address\n\
                   -------------------------------------------------------------------------------\n \
                   vnet0      52:54:00:12:34:56    ipv4         192.168.122.45/24\n";
        assert_eq!(parse_address(out).as_deref(), Some("192.168.122.45"));
        assert_eq!(parse_address(""), None);
    }
}
