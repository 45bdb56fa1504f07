use crate::{
    csum::{ipv4_checksum, IPV4_HDR_LEN},
    Redirect4,
};
use core::{
    mem,
    ptr::{addr_of, addr_of_mut},
};
use network_types::{eth::EthHdr, ip::Ipv4Hdr, udp::UdpHdr};

/// TTL of the re-originated packet.
pub const REDIRECT_TTL: u8 = 64;

const _: () = assert!(mem::size_of::<Ipv4Hdr>() == IPV4_HDR_LEN);

/// Rewrites the headers in place so the packet can be sent back out on the
/// ingress interface toward `target`. The old IP metadata is discarded and
/// the UDP checksum is left out (optional for UDP over IPv4).
///
/// # Safety
///
/// All pointers must come from bounds checked reads of the same packet and
/// the IPv4 header must have no options.
#[inline(always)]
pub unsafe fn redirect4(
    eth: *mut EthHdr,
    ipv4: *mut Ipv4Hdr,
    udp: *mut UdpHdr,
    target: &Redirect4,
) {
    mem::swap(
        &mut *addr_of_mut!((*eth).dst_addr),
        &mut *addr_of_mut!((*eth).src_addr),
    );

    // The tunnel endpoint becomes the source so replies come back here.
    let dst_addr = addr_of!((*ipv4).dst_addr).read_unaligned();
    addr_of_mut!((*ipv4).src_addr).write_unaligned(dst_addr);
    addr_of_mut!((*ipv4).dst_addr).write_unaligned(target.addr);
    addr_of_mut!((*ipv4).ttl).write(REDIRECT_TTL);
    addr_of_mut!((*ipv4).tos).write(0);
    addr_of_mut!((*ipv4).id).write_unaligned(0);
    addr_of_mut!((*ipv4).frag_off).write_unaligned(0);
    addr_of_mut!((*ipv4).check).write_unaligned(0);
    let check = ipv4_checksum(&*(ipv4 as *const [u8; IPV4_HDR_LEN]));
    addr_of_mut!((*ipv4).check).write_unaligned(check);

    let dst_port = addr_of!((*udp).dest).read_unaligned();
    addr_of_mut!((*udp).source).write_unaligned(dst_port);
    addr_of_mut!((*udp).dest).write_unaligned(target.port);
    addr_of_mut!((*udp).check).write_unaligned(0);
}
