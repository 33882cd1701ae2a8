//! Domain and volume descriptor handling.
//!
//! Base images are pre-seeded descriptor pairs on the scheduler host.
//! Before provisioning, the per-build fields are rewritten in memory:
//! the domain name, the disk's source volume, and the VNC password.
//! After the domain is created, the hypervisor-assigned facts (UUID, MAC
//! address, VNC port) are read back out of the live descriptor.

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesStart, BytesText, Event};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("malformed descriptor XML: {0}")]
    Malformed(String),
    #[error("descriptor is missing {0}")]
    Missing(&'static str),
}

impl From<quick_xml::Error> for DescriptorError {
    fn from(e: quick_xml::Error) -> Self {
        DescriptorError::Malformed(e.to_string())
    }
}

/// Facts extracted from a freshly created domain's descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    pub uuid: Uuid,
    pub mac_address: String,
    pub vnc_port: String,
}

/// Rewrite a domain descriptor for one build: set the domain name, point
/// the first disk's source at the build's volume, and set the VNC
/// password on the first graphics device.
pub fn render_domain(xml: &str, name: &str, vnc_passwd: &str) -> Result<String, DescriptorError> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());

    // Element path from the root, excluding the current element.
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut replacing_name = false;
    let mut wrote_name = false;
    let mut set_volume = false;
    let mut set_passwd = false;

    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) => {
                let local = e.name().as_ref().to_vec();
                if !wrote_name && local == b"name" && path.len() == 1 {
                    replacing_name = true;
                    writer.write_event(Event::Start(e))?;
                } else if !set_volume
                    && local == b"source"
                    && path_is(&path, &["domain", "devices", "disk"])
                {
                    set_volume = true;
                    writer.write_event(Event::Start(with_attribute(&e, "volume", name)?))?;
                } else if !set_passwd
                    && local == b"graphics"
                    && path_is(&path, &["domain", "devices"])
                {
                    set_passwd = true;
                    writer.write_event(Event::Start(with_attribute(&e, "passwd", vnc_passwd)?))?;
                } else {
                    writer.write_event(Event::Start(e))?;
                }
                path.push(local);
            }
            Event::Empty(e) => {
                let local = e.name().as_ref().to_vec();
                if !set_volume
                    && local == b"source"
                    && path_is(&path, &["domain", "devices", "disk"])
                {
                    set_volume = true;
                    writer.write_event(Event::Empty(with_attribute(&e, "volume", name)?))?;
                } else if !set_passwd
                    && local == b"graphics"
                    && path_is(&path, &["domain", "devices"])
                {
                    set_passwd = true;
                    writer.write_event(Event::Empty(with_attribute(&e, "passwd", vnc_passwd)?))?;
                } else {
                    writer.write_event(Event::Empty(e))?;
                }
            }
            Event::Text(t) => {
                if replacing_name {
                    writer.write_event(Event::Text(BytesText::new(name)))?;
                } else {
                    writer.write_event(Event::Text(t))?;
                }
            }
            Event::End(e) => {
                if replacing_name && e.name().as_ref() == b"name" {
                    replacing_name = false;
                    wrote_name = true;
                }
                path.pop();
                writer.write_event(Event::End(e))?;
            }
            other => writer.write_event(other)?,
        }
    }

    if !wrote_name {
        return Err(DescriptorError::Missing("name element"));
    }

    String::from_utf8(writer.into_inner()).map_err(|e| DescriptorError::Malformed(e.to_string()))
}

/// Rewrite a volume descriptor's name for one build.
pub fn render_volume(xml: &str, name: &str) -> Result<String, DescriptorError> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());

    let mut depth = 0usize;
    let mut replacing_name = false;
    let mut wrote_name = false;

    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) => {
                if !wrote_name && e.name().as_ref() == b"name" && depth == 1 {
                    replacing_name = true;
                }
                depth += 1;
                writer.write_event(Event::Start(e))?;
            }
            Event::Text(t) => {
                if replacing_name {
                    writer.write_event(Event::Text(BytesText::new(name)))?;
                } else {
                    writer.write_event(Event::Text(t))?;
                }
            }
            Event::End(e) => {
                if replacing_name && e.name().as_ref() == b"name" {
                    replacing_name = false;
                    wrote_name = true;
                }
                depth = depth.saturating_sub(1);
                writer.write_event(Event::End(e))?;
            }
            other => writer.write_event(other)?,
        }
    }

    if !wrote_name {
        return Err(DescriptorError::Missing("name element"));
    }

    String::from_utf8(writer.into_inner()).map_err(|e| DescriptorError::Malformed(e.to_string()))
}

/// Extract the hypervisor-assigned facts from a live domain descriptor.
pub fn extract_domain_info(xml: &str) -> Result<DomainInfo, DescriptorError> {
    let mut reader = Reader::from_str(xml);

    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut in_uuid = false;
    let mut uuid: Option<Uuid> = None;
    let mut mac_address: Option<String> = None;
    let mut vnc_port: Option<String> = None;

    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) => {
                let local = e.name().as_ref().to_vec();
                if local == b"uuid" && path.len() == 1 {
                    in_uuid = true;
                } else if mac_address.is_none()
                    && local == b"mac"
                    && path_is(&path, &["domain", "devices", "interface"])
                {
                    mac_address = attribute_value(&e, "address")?;
                } else if vnc_port.is_none()
                    && local == b"graphics"
                    && path_is(&path, &["domain", "devices"])
                {
                    vnc_port = attribute_value(&e, "port")?;
                }
                path.push(local);
            }
            Event::Empty(e) => {
                let local = e.name().as_ref().to_vec();
                if mac_address.is_none()
                    && local == b"mac"
                    && path_is(&path, &["domain", "devices", "interface"])
                {
                    mac_address = attribute_value(&e, "address")?;
                } else if vnc_port.is_none()
                    && local == b"graphics"
                    && path_is(&path, &["domain", "devices"])
                {
                    vnc_port = attribute_value(&e, "port")?;
                }
            }
            Event::Text(t) => {
                if in_uuid && uuid.is_none() {
                    let text = t
                        .unescape()
                        .map_err(|e| DescriptorError::Malformed(e.to_string()))?;
                    uuid = Some(
                        Uuid::parse_str(text.trim())
                            .map_err(|e| DescriptorError::Malformed(e.to_string()))?,
                    );
                }
            }
            Event::End(e) => {
                if e.name().as_ref() == b"uuid" {
                    in_uuid = false;
                }
                path.pop();
            }
            _ => {}
        }
    }

    Ok(DomainInfo {
        uuid: uuid.ok_or(DescriptorError::Missing("uuid"))?,
        mac_address: mac_address.ok_or(DescriptorError::Missing("interface mac address"))?,
        vnc_port: vnc_port.ok_or(DescriptorError::Missing("graphics port"))?,
    })
}

/// Extract the domain or volume name (first `name` element under the root).
pub fn extract_name(xml: &str) -> Result<String, DescriptorError> {
    let mut reader = Reader::from_str(xml);
    let mut depth = 0usize;
    let mut in_name = false;

    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) => {
                if e.name().as_ref() == b"name" && depth == 1 {
                    in_name = true;
                }
                depth += 1;
            }
            Event::Text(t) => {
                if in_name {
                    let text = t
                        .unescape()
                        .map_err(|e| DescriptorError::Malformed(e.to_string()))?;
                    return Ok(text.trim().to_string());
                }
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                in_name = false;
            }
            _ => {}
        }
    }

    Err(DescriptorError::Missing("name element"))
}

fn path_is(path: &[Vec<u8>], expected: &[&str]) -> bool {
    path.len() == expected.len()
        && path
            .iter()
            .zip(expected)
            .all(|(have, want)| have.as_slice() == want.as_bytes())
}

fn attribute_value(e: &BytesStart<'_>, name: &str) -> Result<Option<String>, DescriptorError> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| DescriptorError::Malformed(e.to_string()))?;
        if attr.key.as_ref() == name.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|e| DescriptorError::Malformed(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Copy an element, replacing (or adding) one attribute.
fn with_attribute(
    e: &BytesStart<'_>,
    name: &str,
    value: &str,
) -> Result<BytesStart<'static>, DescriptorError> {
    let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut elem = BytesStart::new(tag);
    for attr in e.attributes() {
        let attr = attr.map_err(|e| DescriptorError::Malformed(e.to_string()))?;
        if attr.key.as_ref() == name.as_bytes() {
            continue;
        }
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let val = attr
            .unescape_value()
            .map_err(|e| DescriptorError::Malformed(e.to_string()))?
            .into_owned();
        elem.push_attribute((key.as_str(), val.as_str()));
    }
    elem.push_attribute((name, value));
    Ok(elem)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN_XML: &str = r#"<domain type='kvm'>
  <name>base</name>
  <memory unit='KiB'>1048576</memory>
  <devices>
    <disk type='volume' device='disk'>
      <source pool='ipd-images' volume='base'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='bridge'>
      <source bridge='br0'/>
    </interface>
    <graphics type='vnc' port='-1' autoport='yes'/>
  </devices>
</domain>"#;

    const VOLUME_XML: &str = r#"<volume>
  <name>base</name>
  <capacity unit='G'>10</capacity>
</volume>"#;

    #[test]
    fn test_render_domain_sets_all_fields() {
        let out = render_domain(DOMAIN_XML, "demo-1", "s3cret").unwrap();
        assert!(out.contains("<name>demo-1</name>"));
        assert!(out.contains("volume=\"demo-1\""));
        assert!(out.contains("passwd=\"s3cret\""));
        // Untouched parts survive with their original quoting.
        assert!(out.contains("pool=\"ipd-images\"") || out.contains("pool='ipd-images'"));
        assert!(out.contains("autoport"));
    }

    #[test]
    fn test_render_domain_replaces_existing_passwd() {
        let xml = DOMAIN_XML.replace("autoport='yes'", "autoport='yes' passwd='old'");
        let out = render_domain(&xml, "demo-1", "new-pass").unwrap();
        assert!(out.contains("passwd=\"new-pass\""));
        assert!(!out.contains("old"));
    }

    #[test]
    fn test_render_domain_leaves_interface_source_alone() {
        let out = render_domain(DOMAIN_XML, "demo-1", "pw").unwrap();
        assert!(out.contains("bridge=\"br0\"") || out.contains("bridge='br0'"));
        assert_eq!(out.matches("volume=").count(), 1);
    }

    #[test]
    fn test_render_domain_missing_name() {
        let result = render_domain("<domain><devices/></domain>", "x", "y");
        assert!(matches!(result, Err(DescriptorError::Missing(_))));
    }

    #[test]
    fn test_render_volume() {
        let out = render_volume(VOLUME_XML, "demo-1").unwrap();
        assert!(out.contains("<name>demo-1</name>"));
        assert!(out.contains("capacity"));
    }

    #[test]
    fn test_extract_domain_info() {
        let xml = r#"<domain type='kvm'>
  <name>demo-1</name>
  <uuid>2c5f0bbd-edd6-4860-b40a-f2ad2a1f0df9</uuid>
  <devices>
    <interface type='bridge'>
      <mac address='52:54:00:aa:bb:cc'/>
    </interface>
    <graphics type='vnc' port='5901' passwd='pw'/>
  </devices>
</domain>"#;
        let info = extract_domain_info(xml).unwrap();
        assert_eq!(
            info.uuid,
            Uuid::parse_str("2c5f0bbd-edd6-4860-b40a-f2ad2a1f0df9").unwrap()
        );
        assert_eq!(info.mac_address, "52:54:00:aa:bb:cc");
        assert_eq!(info.vnc_port, "5901");
    }

    #[test]
    fn test_extract_domain_info_missing_uuid() {
        let xml = "<domain><name>x</name><devices><interface><mac address='a'/></interface><graphics port='1'/></devices></domain>";
        assert!(matches!(
            extract_domain_info(xml),
            Err(DescriptorError::Missing("uuid"))
        ));
    }

    #[test]
    fn test_extract_after_render() {
        let xml = r#"<domain type='kvm'>
  <name>base</name>
  <uuid>9d2f43b1-05c2-4e21-8f3f-6d90a87be0a1</uuid>
  <devices>
    <disk type='volume'><source pool='ipd-images' volume='base'/></disk>
    <interface><mac address='52:54:00:11:22:33'/></interface>
    <graphics type='vnc' port='5900'/>
  </devices>
</domain>"#;
        let rendered = render_domain(xml, "demo-3", "pw").unwrap();
        let info = extract_domain_info(&rendered).unwrap();
        assert_eq!(info.mac_address, "52:54:00:11:22:33");
        assert_eq!(info.vnc_port, "5900");
    }

    #[test]
    fn test_extract_name() {
        assert_eq!(extract_name(DOMAIN_XML).unwrap(), "base");
        assert_eq!(extract_name(VOLUME_XML).unwrap(), "base");
        assert!(extract_name("<domain/>").is_err());
    }
}
