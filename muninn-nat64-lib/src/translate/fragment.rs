//! Post-translation IPv6 fragmentation.
//!
//! Only the v4→v6 direction fragments; IPv4 routers handle their own.
//! The packet is already fully assembled and checksummed when it gets
//! here, so the work is pure byte surgery: replicate the 48-byte
//! header block (IPv6 + fragment header) and deal the payload out in
//! 8-byte-aligned pieces.

use etherparse::Ipv6Header;

use super::{assemble, OutPkt, XlationCtx};
use crate::icmp::IcmpKind;
use crate::packet::{icmp6_type_is_error, Breakdown, IpPkt, L4Hdr};
use crate::stats::StatId;
use crate::types::L3Proto;

/// IPv6 header plus fragment header.
const HDRS_LEN: usize = Ipv6Header::LEN + 8;

pub(super) fn fragment_if_too_big(
    ctx: &XlationCtx<'_>,
    out: OutPkt,
) -> Result<Vec<(L3Proto, Vec<u8>)>, Breakdown> {
    let (family, mut frame) = assemble(&out)?;
    if family == L3Proto::V4 {
        return Ok(vec![(family, frame)]);
    }

    let route_mtu = ctx.route.map_or(u16::MAX, |r| r.mtu);
    let mtu = usize::from(ctx.cfg.translate.min_ipv6_mtu.min(route_mtu));
    if frame.len() <= mtu {
        return Ok(vec![(family, frame)]);
    }

    // ICMP errors are truncated, never fragmented (RFC 4443).
    if matches!(&out.l4, L4Hdr::Icmp6(h) if icmp6_type_is_error(&h.icmp_type)) {
        frame.truncate(mtu);
        patch_payload_length(&mut frame, mtu - Ipv6Header::LEN);
        return Ok(vec![(family, frame)]);
    }

    let IpPkt::V4(in_pkt) = ctx.in_pkt else {
        return Err(Breakdown::drop(StatId::PktTooBig));
    };
    if in_pkt.hdr.dont_fragment {
        let next_hop = u16::try_from(mtu - 20).unwrap_or(u16::MAX);
        return Err(Breakdown::with_icmp(
            StatId::PktTooBig,
            IcmpKind::FragNeeded { mtu: next_hop },
        ));
    }

    divide(frame, mtu)
}

/// Splits `frame` into fragments of at most `mtu` bytes. Assumes a
/// fragment header is in place, which the v4→v6 header step guarantees
/// for every DF-clear packet.
fn divide(frame: Vec<u8>, mtu: usize) -> Result<Vec<(L3Proto, Vec<u8>)>, Breakdown> {
    if frame.len() < HDRS_LEN || frame[6] != 44 {
        return Err(Breakdown::drop(StatId::Unknown));
    }

    let mtu = mtu & !7;
    let payload_max = mtu - HDRS_LEN;
    let (original_offset, original_mf) = read_frag_field(&frame);

    let header: Vec<u8> = frame[..HDRS_LEN].to_vec();
    let mut frames = Vec::new();

    // First fragment: the original packet cut down to the MTU.
    let mut first = frame[..mtu].to_vec();
    patch_payload_length(&mut first, mtu - Ipv6Header::LEN);
    patch_frag_field(&mut first, original_offset, true);
    frames.push((L3Proto::V6, first));

    let mut pos = mtu;
    while pos < frame.len() {
        let remaining = frame.len() - pos;
        let is_last = remaining <= payload_max;
        let chunk = remaining.min(payload_max);

        let mut piece = Vec::with_capacity(HDRS_LEN + chunk);
        piece.extend_from_slice(&header);
        piece.extend_from_slice(&frame[pos..pos + chunk]);
        patch_payload_length(&mut piece, 8 + chunk);
        patch_frag_field(
            &mut piece,
            original_offset + (pos - HDRS_LEN),
            if is_last { original_mf } else { true },
        );
        frames.push((L3Proto::V6, piece));

        pos += chunk;
    }

    Ok(frames)
}

fn patch_payload_length(frame: &mut [u8], payload_len: usize) {
    let value = payload_len as u16;
    frame[4..6].copy_from_slice(&value.to_be_bytes());
}

/// (offset in bytes, more-fragments) from the fragment header.
fn read_frag_field(frame: &[u8]) -> (usize, bool) {
    let raw = u16::from_be_bytes([frame[42], frame[43]]);
    ((usize::from(raw >> 3)) * 8, raw & 1 == 1)
}

fn patch_frag_field(frame: &mut [u8], offset_bytes: usize, more_fragments: bool) {
    let field = ((offset_bytes as u16 / 8) << 3) | u16::from(more_fragments);
    frame[42..44].copy_from_slice(&field.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag_frame(payload_len: usize, id: u32) -> Vec<u8> {
        let mut frame = vec![0u8; HDRS_LEN + payload_len];
        frame[0] = 0x60;
        frame[6] = 44; // next header: fragment
        let plen = (8 + payload_len) as u16;
        frame[4..6].copy_from_slice(&plen.to_be_bytes());
        frame[40] = 17; // fragment's next header: UDP
        frame[44..48].copy_from_slice(&id.to_be_bytes());
        for (i, b) in frame[HDRS_LEN..].iter_mut().enumerate() {
            *b = i as u8;
        }
        frame
    }

    #[test]
    fn divide_respects_the_mtu_and_offsets() {
        // 2028 bytes total, like a 2000-byte DF-clear IPv4 packet
        // after translation and the fragment header.
        let frame = frag_frame(2028 - HDRS_LEN, 0xabcd);
        let frames = divide(frame, 1280).unwrap();
        assert_eq!(frames.len(), 2);

        let (_, first) = &frames[0];
        let (_, second) = &frames[1];
        assert_eq!(first.len(), 1280);
        assert_eq!(second.len(), HDRS_LEN + (2028 - 1280));

        let (off1, mf1) = read_frag_field(first);
        let (off2, mf2) = read_frag_field(second);
        assert_eq!((off1, mf1), (0, true));
        assert_eq!((off2, mf2), (1280 - HDRS_LEN, false));
        assert_eq!(off2 % 8, 0);

        // Shared identification, and the payload bytes survive intact.
        assert_eq!(first[44..48], second[44..48]);
        assert_eq!(second[HDRS_LEN], first[1279].wrapping_add(1));
    }

    #[test]
    fn divide_keeps_the_original_mf_on_the_last_piece() {
        let mut frame = frag_frame(2000, 1);
        patch_frag_field(&mut frame, 0, true); // already a non-final fragment
        let frames = divide(frame, 1280).unwrap();
        let (_, mf) = read_frag_field(&frames.last().unwrap().1);
        assert!(mf, "a middle fragment stays a middle fragment");
    }

    #[test]
    fn every_fragment_offset_is_8_aligned() {
        let frame = frag_frame(5000, 2);
        for (_, piece) in divide(frame, 1280).unwrap() {
            let (off, _) = read_frag_field(&piece);
            assert_eq!(off % 8, 0);
        }
    }
}
