use byteorder::{ByteOrder, NetworkEndian};
use color_eyre::eyre::Result;
use eui48::MacAddress;
use std::convert::TryInto;

pub const ETHERNET_HEADER_SIZE: usize = 14;
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_8021Q: u16 = 0x8100;

/// Destination address of an Ethernet frame; `None` if the frame is shorter
/// than the addressable header.
pub fn ether_dst(frame: &[u8]) -> Option<MacAddress> {
    if frame.len() < ETHERNET_HEADER_SIZE {
        return None;
    }
    let mut octets = [0u8; 6];
    octets.copy_from_slice(&frame[0..6]);
    Some(MacAddress::new(octets))
}

pub fn ether_src(frame: &[u8]) -> Option<MacAddress> {
    if frame.len() < ETHERNET_HEADER_SIZE {
        return None;
    }
    let mut octets = [0u8; 6];
    octets.copy_from_slice(&frame[6..12]);
    Some(MacAddress::new(octets))
}

pub fn ether_type(frame: &[u8]) -> Option<u16> {
    if frame.len() < ETHERNET_HEADER_SIZE {
        return None;
    }
    Some(NetworkEndian::read_u16(&frame[12..14]))
}

/// Multicast/broadcast test: least-significant bit of the first octet.
pub fn is_multicast(mac: &MacAddress) -> bool {
    mac.as_bytes()[0] & 0x01 != 0
}

#[inline]
pub fn write_eth_hdr(
    dst: &MacAddress,
    src: &MacAddress,
    ether_type: u16,
    buf: &mut [u8],
) -> Result<()> {
    let buf: &mut [u8; ETHERNET_HEADER_SIZE] = (&mut buf[..ETHERNET_HEADER_SIZE]).try_into()?;
    buf[0..6].copy_from_slice(dst.as_bytes());
    buf[6..12].copy_from_slice(src.as_bytes());
    NetworkEndian::write_u16(&mut buf[12..14], ether_type);
    Ok(())
}

/// Builds a complete frame from header fields plus payload; handy for drivers
/// and tests that synthesize traffic.
pub fn ethernet_frame(
    dst: &MacAddress,
    src: &MacAddress,
    ether_type: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = vec![0u8; ETHERNET_HEADER_SIZE + payload.len()];
    // infallible: the buffer is always header-sized
    let _ = write_eth_hdr(dst, src, ether_type, &mut frame);
    frame[ETHERNET_HEADER_SIZE..].copy_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_header_fields() {
        let dst = MacAddress::parse_str("02:00:00:00:00:01").unwrap();
        let src = MacAddress::parse_str("02:00:00:00:00:02").unwrap();
        let frame = ethernet_frame(&dst, &src, ETHERTYPE_IPV4, &[0xab; 16]);
        assert_eq!(ether_dst(&frame), Some(dst));
        assert_eq!(ether_src(&frame), Some(src));
        assert_eq!(ether_type(&frame), Some(ETHERTYPE_IPV4));
    }

    #[test]
    fn short_frame_has_no_header() {
        assert_eq!(ether_dst(&[0u8; 13]), None);
        assert_eq!(ether_type(&[]), None);
    }

    #[test]
    fn multicast_bit() {
        assert!(is_multicast(&MacAddress::broadcast()));
        assert!(is_multicast(
            &MacAddress::parse_str("01:00:5e:00:00:01").unwrap()
        ));
        assert!(!is_multicast(
            &MacAddress::parse_str("02:00:00:00:00:01").unwrap()
        ));
    }
}
