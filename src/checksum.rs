//! Internet checksum calculation.
//!
//! One's-complement sums for the headers this engine rewrites. TCP and UDP
//! share the IPv4 pseudo-header form; ICMP covers only the ICMP bytes.
//!
//! Verification is "recompute and compare to zero": summing a well-formed
//! header or segment over its as-received bytes, checksum field included,
//! yields `0x0000`.

use std::net::Ipv4Addr;

/// Folds a 32-bit sum into a 16-bit one's-complement checksum.
///
/// Two folds always suffice for a 32-bit accumulator: the first leaves at
/// most one bit of carry, the second absorbs it.
#[inline]
#[must_use]
pub fn checksum_fold(sum: u32) -> u16 {
    let folded = (sum & 0xFFFF) + (sum >> 16);
    let folded = (folded & 0xFFFF) + (folded >> 16);
    !(folded as u16)
}

/// One's-complement sum of 16-bit big-endian words.
///
/// An odd trailing byte is taken as the high byte of an implicit word.
#[inline]
#[must_use]
pub fn checksum_add(data: &[u8]) -> u32 {
    let mut words = data.chunks_exact(2);
    let mut acc: u32 = 0;

    for word in words.by_ref() {
        acc = acc.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    if let Some(&tail) = words.remainder().first() {
        acc = acc.wrapping_add(u32::from(tail) << 8);
    }

    acc
}

/// Internet checksum over a byte buffer.
#[inline]
#[must_use]
pub fn checksum(data: &[u8]) -> u16 {
    checksum_fold(checksum_add(data))
}

/// IPv4 header checksum.
///
/// Covers the header only. The checksum field must be zeroed before
/// calculation.
#[inline]
#[must_use]
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    debug_assert!(header.len() >= 20, "IPv4 header too short");
    checksum(header)
}

/// L4 checksum over the IPv4 pseudo-header and the full segment.
///
/// The pseudo-header is `(src, dst, zero, protocol, segment length)`; the
/// segment is the L4 header plus payload with its checksum field zeroed.
#[must_use]
pub fn l4_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let acc = checksum_add(&src.octets())
        .wrapping_add(checksum_add(&dst.octets()))
        .wrapping_add(u32::from(protocol))
        .wrapping_add(segment.len() as u32)
        .wrapping_add(checksum_add(segment));

    checksum_fold(acc)
}

/// UDP checksum including the pseudo-header.
///
/// A computed sum of zero is transmitted as `0xFFFF`; on the wire, zero
/// means "no checksum" (RFC 768).
#[must_use]
pub fn udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, datagram: &[u8]) -> u16 {
    let result = l4_checksum(src, dst, 17, datagram);
    if result == 0 {
        0xFFFF
    } else {
        result
    }
}

/// ICMP checksum over the ICMP header and payload.
#[inline]
#[must_use]
pub fn icmp_checksum(data: &[u8]) -> u16 {
    checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_address_words() {
        // External address 1.2.3.4 followed by 8.8.8.8:
        // 0x0102 + 0x0304 + 0x0808 + 0x0808 = 0x1416, ~0x1416 = 0xEBE9
        let data = [1, 2, 3, 4, 8, 8, 8, 8];
        assert_eq!(checksum(&data), 0xEBE9);
    }

    #[test]
    fn test_checksum_odd_trailing_byte() {
        // 192.168.1.100 with a lone port byte: the trailing 0x35 counts as
        // the high byte of an implicit word.
        // 0xC0A8 + 0x0164 + 0x3500 = 0xF70C, ~0xF70C = 0x08F3
        let data = [192, 168, 1, 100, 53];
        assert_eq!(checksum(&data), 0x08F3);
    }

    #[test]
    fn test_checksum_fold_carries() {
        // 0xFFFF + 0xFFFF + 0x0002 = 0x20000 folds to 0x0002.
        let data = [0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x02];
        assert_eq!(checksum(&data), 0xFFFD);

        // An empty buffer sums to zero and complements to all ones.
        assert_eq!(checksum(&[]), 0xFFFF);
    }

    #[test]
    fn test_checksum_verifies_to_zero() {
        // 20-byte UDP header toward 8.8.8.8, checksum field initially zero.
        let mut header: [u8; 20] = [
            0x45, 0x00, 0x00, 0x28, 0xd4, 0x31, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x01, 0x64, 0x08, 0x08, 0x08, 0x08,
        ];
        let sum = ipv4_checksum(&header);
        header[10..12].copy_from_slice(&sum.to_be_bytes());

        // Summing over the stored checksum yields zero.
        assert_eq!(checksum(&header), 0);
    }

    #[test]
    fn test_l4_checksum_verifies_to_zero() {
        let src = Ipv4Addr::new(192, 168, 1, 100);
        let dst = Ipv4Addr::new(8, 8, 8, 8);

        let mut segment = vec![0u8; 28];
        segment[0..2].copy_from_slice(&5000u16.to_be_bytes());
        segment[2..4].copy_from_slice(&53u16.to_be_bytes());
        segment[4..6].copy_from_slice(&28u16.to_be_bytes());
        segment[8..].copy_from_slice(b"checksum me please!!");

        let sum = l4_checksum(src, dst, 17, &segment);
        segment[6..8].copy_from_slice(&sum.to_be_bytes());

        assert_eq!(l4_checksum(src, dst, 17, &segment), 0);
    }

    #[test]
    fn test_udp_zero_maps_to_ffff() {
        // Pseudo-header contributes 17 (protocol) + 2 (length); the segment
        // word brings the folded sum to 0xFFFF, whose complement is zero.
        let zero = Ipv4Addr::UNSPECIFIED;
        assert_eq!(udp_checksum(zero, zero, &[0xFF, 0xEC]), 0xFFFF);
    }
}
