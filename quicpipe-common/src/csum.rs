//! IPv4 header checksum, see https://datatracker.ietf.org/doc/html/rfc1071#section-4.1

/// Fixed IPv4 header length. Headers with options never get here.
pub const IPV4_HDR_LEN: usize = 20;

/// One's complement sum of the header taken as big-endian 16-bit words.
#[inline(always)]
pub fn ones_complement_sum(hdr: &[u8; IPV4_HDR_LEN]) -> u16 {
    let mut sum = 0_u32;

    for i in 0..IPV4_HDR_LEN / 2 {
        sum += (hdr[2 * i] as u32) << 8 | hdr[2 * i + 1] as u32;
        if sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
    }

    // no options so no padding
    if sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    sum as u16
}

/// Returns the checksum in network byte order, ready to be stored in the
/// header. The checksum field must be zero before calling this.
#[inline(always)]
pub fn ipv4_checksum(hdr: &[u8; IPV4_HDR_LEN]) -> u16 {
    (!ones_complement_sum(hdr)).to_be()
}
