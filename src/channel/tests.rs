use super::*;
use crate::bitstream::{BitReader, BitWriter};
use crate::connection::bunch::{Bunch, WireName};

fn data_bunch(payload: &[u8]) -> Bunch {
    let mut b = Bunch::new(2, WireName::Hardcoded(2));
    b.set_payload_bytes(payload);
    b
}

fn reliable_bunch(seq: u32, payload: &[u8]) -> Bunch {
    let mut b = data_bunch(payload);
    b.reliable = true;
    b.ch_sequence = seq;
    b
}

fn fragment(
    reliable: bool,
    seq: u32,
    initial: bool,
    is_final: bool,
    payload: &[u8],
    bits: usize,
) -> Bunch {
    let mut b = Bunch::new(2, WireName::Hardcoded(2));
    b.reliable = reliable;
    b.ch_sequence = seq;
    b.partial = true;
    b.partial_initial = initial;
    b.partial_final = is_final;
    b.set_payload_bits(payload, bits);
    b
}

#[test]
fn partial_reassembly_in_order() {
    let mut ch = Channel::new(2, ChannelKind::Actor, false);
    let mut in_reliable = 0u16;

    let first = vec![0x11u8; 100];
    let middle = vec![0x22u8; 200];
    let last = vec![0x33u8, 0x44, 0x55, 0x66, 0x1F]; // 37 bits

    let r1 = ch
        .received_raw_bunch(
            fragment(true, 1, true, false, &first, 800),
            &mut in_reliable,
            false,
        )
        .unwrap();
    assert!(r1.is_empty());
    let r2 = ch
        .received_raw_bunch(
            fragment(true, 2, false, false, &middle, 1600),
            &mut in_reliable,
            false,
        )
        .unwrap();
    assert!(r2.is_empty());
    let r3 = ch
        .received_raw_bunch(
            fragment(true, 3, false, true, &last, 37),
            &mut in_reliable,
            false,
        )
        .unwrap();

    assert_eq!(r3.len(), 1);
    let merged = &r3[0];
    assert!(merged.partial_final);
    assert_eq!(merged.payload_bits, 800 + 1600 + 37);
    assert_eq!(&merged.payload[..100], &first[..]);
    assert_eq!(&merged.payload[100..300], &middle[..]);
    assert_eq!(&merged.payload[300..305], &last[..]);
    assert_eq!(in_reliable, 3);
}

#[test]
fn out_of_order_fragments_are_rejected() {
    let mut ch = Channel::new(2, ChannelKind::Actor, false);
    let mut in_reliable = 0u16;

    // Middle before initial: nothing to attach to, dropped.
    let middle = fragment(false, 0, false, false, &[0xAA; 8], 64);
    let out = ch
        .received_raw_bunch(middle, &mut in_reliable, false)
        .unwrap();
    assert!(out.is_empty());

    // The buffer stayed empty: a final fragment alone is also dropped.
    let last = fragment(false, 0, false, true, &[0xBB; 4], 32);
    let out = ch
        .received_raw_bunch(last, &mut in_reliable, false)
        .unwrap();
    assert!(out.is_empty());
}

#[test]
fn partial_collision_reliable_vs_reliable_is_fatal() {
    let mut ch = Channel::new(2, ChannelKind::Actor, false);
    let mut in_reliable = 0u16;

    ch.received_raw_bunch(
        fragment(true, 1, true, false, &[1; 16], 128),
        &mut in_reliable,
        false,
    )
    .unwrap();
    let err = ch
        .received_raw_bunch(
            fragment(true, 2, true, false, &[2; 16], 128),
            &mut in_reliable,
            false,
        )
        .unwrap_err();
    assert_eq!(err, ChannelError::PartialInitialReliableDestroy);
}

#[test]
fn partial_collision_unreliable_yields_to_reliable() {
    let mut ch = Channel::new(2, ChannelKind::Actor, false);
    let mut in_reliable = 0u16;

    // Reliable buffer in progress; an unreliable initial must not disturb it.
    ch.received_raw_bunch(
        fragment(true, 1, true, false, &[1; 16], 128),
        &mut in_reliable,
        false,
    )
    .unwrap();
    let out = ch
        .received_raw_bunch(
            fragment(false, 0, true, false, &[9; 16], 128),
            &mut in_reliable,
            false,
        )
        .unwrap();
    assert!(out.is_empty());

    // The reliable stream still completes.
    let done = ch
        .received_raw_bunch(
            fragment(true, 2, false, true, &[3; 4], 32),
            &mut in_reliable,
            false,
        )
        .unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].payload_bits, 128 + 32);
    assert_eq!(&done[0].payload[..16], &[1; 16]);
}

#[test]
fn partial_collision_reliable_replaces_unreliable() {
    let mut ch = Channel::new(2, ChannelKind::Actor, false);
    let mut in_reliable = 0u16;

    ch.received_raw_bunch(
        fragment(false, 0, true, false, &[9; 16], 128),
        &mut in_reliable,
        false,
    )
    .unwrap();
    // A reliable initial discards the unfinished unreliable buffer.
    ch.received_raw_bunch(
        fragment(true, 1, true, false, &[1; 16], 128),
        &mut in_reliable,
        false,
    )
    .unwrap();
    let done = ch
        .received_raw_bunch(
            fragment(true, 2, false, true, &[2; 2], 16),
            &mut in_reliable,
            false,
        )
        .unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(&done[0].payload[..16], &[1; 16]);
}

#[test]
fn partial_collision_unreliable_replaces_unreliable() {
    let mut ch = Channel::new(2, ChannelKind::Actor, false);
    let mut in_reliable = 0u16;

    ch.received_raw_bunch(
        fragment(false, 0, true, false, &[7; 8], 64),
        &mut in_reliable,
        false,
    )
    .unwrap();
    ch.received_raw_bunch(
        fragment(false, 0, true, false, &[8; 8], 64),
        &mut in_reliable,
        false,
    )
    .unwrap();
    let done = ch
        .received_raw_bunch(
            fragment(false, 0, false, true, &[9; 1], 8),
            &mut in_reliable,
            false,
        )
        .unwrap();
    // The second initial owns the buffer.
    assert_eq!(done.len(), 1);
    assert_eq!(&done[0].payload[..8], &[8; 8]);
}

#[test]
fn reliable_ordering_waits_for_missing_predecessor() {
    let mut ch = Channel::new(2, ChannelKind::Actor, false);
    let mut in_reliable = 0u16;

    // Sequence 2 arrives first (skipping 1): queued, not dispatched.
    let out = ch
        .received_raw_bunch(reliable_bunch(2, b"second"), &mut in_reliable, false)
        .unwrap();
    assert!(out.is_empty());
    assert_eq!(in_reliable, 0);

    // Sequence 1 arrives: both dispatch, in order.
    let out = ch
        .received_raw_bunch(reliable_bunch(1, b"first"), &mut in_reliable, false)
        .unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].payload, b"first");
    assert_eq!(out[1].payload, b"second");
    assert_eq!(in_reliable, 2);
}

#[test]
fn duplicate_reliable_bunch_is_dropped() {
    let mut ch = Channel::new(2, ChannelKind::Actor, false);
    let mut in_reliable = 0u16;

    let out = ch
        .received_raw_bunch(reliable_bunch(1, b"x"), &mut in_reliable, false)
        .unwrap();
    assert_eq!(out.len(), 1);
    let out = ch
        .received_raw_bunch(reliable_bunch(1, b"x"), &mut in_reliable, false)
        .unwrap();
    assert!(out.is_empty());
    assert_eq!(in_reliable, 1);
}

#[test]
fn internal_ack_connection_rejects_gaps() {
    let mut ch = Channel::new(2, ChannelKind::Actor, false);
    let mut in_reliable = 0u16;

    let err = ch
        .received_raw_bunch(reliable_bunch(2, b"gap"), &mut in_reliable, true)
        .unwrap_err();
    assert_eq!(err, ChannelError::ReliableGapOnInternalAck);
}

#[test]
fn unaligned_non_final_fragment() {
    // Reliable: fatal.
    let mut ch = Channel::new(2, ChannelKind::Actor, false);
    let mut in_reliable = 0u16;
    let err = ch
        .received_raw_bunch(
            fragment(true, 1, true, false, &[1; 2], 13),
            &mut in_reliable,
            false,
        )
        .unwrap_err();
    assert_eq!(err, ChannelError::PartialFragmentUnaligned);

    // Unreliable: the buffer is dropped, nothing fatal.
    let mut ch = Channel::new(2, ChannelKind::Actor, false);
    let mut in_reliable = 0u16;
    ch.received_raw_bunch(
        fragment(false, 0, true, false, &[1; 8], 64),
        &mut in_reliable,
        false,
    )
    .unwrap();
    let out = ch
        .received_raw_bunch(
            fragment(false, 0, false, false, &[2; 2], 13),
            &mut in_reliable,
            false,
        )
        .unwrap();
    assert!(out.is_empty());
    // A final fragment now finds no buffer.
    let out = ch
        .received_raw_bunch(
            fragment(false, 0, false, true, &[3; 1], 8),
            &mut in_reliable,
            false,
        )
        .unwrap();
    assert!(out.is_empty());
}

#[test]
fn oversized_merge_is_fatal() {
    let mut ch = Channel::new(2, ChannelKind::Actor, false);
    let mut in_reliable = 0u16;

    let chunk = vec![0u8; 48 * 1024];
    ch.received_raw_bunch(
        fragment(true, 1, true, false, &chunk, chunk.len() * 8),
        &mut in_reliable,
        false,
    )
    .unwrap();
    let err = ch
        .received_raw_bunch(
            fragment(true, 2, false, false, &chunk, chunk.len() * 8),
            &mut in_reliable,
            false,
        )
        .unwrap_err();
    assert!(matches!(err, ChannelError::PartialMergeTooLarge(_)));
}

#[test]
fn ahead_queue_overflow_breaks_channel() {
    let mut ch = Channel::new(2, ChannelKind::Actor, false);
    let mut in_reliable = 0u16;

    // Fill the ahead-of-order queue with a gap at sequence 1.
    for seq in 2..(2 + RELIABLE_BUFFER as u32) {
        ch.received_raw_bunch(reliable_bunch(seq, b"q"), &mut in_reliable, false)
            .unwrap();
    }
    let err = ch
        .received_raw_bunch(
            reliable_bunch(2 + RELIABLE_BUFFER as u32, b"q"),
            &mut in_reliable,
            false,
        )
        .unwrap_err();
    assert!(matches!(err, ChannelError::ReliableBufferOverflow(2)));
    assert!(ch.broken);
}

#[test]
fn out_record_ack_and_nak() {
    use crate::seq::SeqNum;

    let mut ch = Channel::new(1, ChannelKind::Control, true);
    let mut open = reliable_bunch(1, b"open");
    open.open = true;
    ch.push_out_record(open, SeqNum::new(10)).unwrap();
    ch.push_out_record(reliable_bunch(2, b"data"), SeqNum::new(11))
        .unwrap();

    // Packet 11 lost: its bunch comes out of the records for
    // retransmission under a new packet id.
    let lost = ch.take_naked(SeqNum::new(11));
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].payload, b"data");
    ch.push_out_record(lost.into_iter().next().unwrap(), SeqNum::new(12))
        .unwrap();

    // Packet 10 acked: the open bunch clears and flips open_acked.
    assert!(ch.acked_packet(SeqNum::new(10)));
    assert!(ch.open_acked);
    assert!(ch.has_pending_reliable());
    ch.acked_packet(SeqNum::new(12));
    assert!(!ch.has_pending_reliable());
}

#[test]
fn close_lifecycle() {
    use crate::connection::bunch::CloseReason;
    use crate::seq::SeqNum;

    let mut ch = Channel::new(3, ChannelKind::Voice, true);
    ch.push_out_record(reliable_bunch(1, b"x"), SeqNum::new(5))
        .unwrap();
    ch.start_close(CloseReason::Dormancy);
    assert!(ch.closing);
    assert!(ch.dormant);
    assert!(!ch.can_destroy());
    ch.acked_packet(SeqNum::new(5));
    assert!(ch.can_destroy());

    assert!(!CloseReason::Dormancy.destroys_remote_state());
    assert!(CloseReason::Destroyed.destroys_remote_state());
    assert!(CloseReason::TearOff.destroys_remote_state());
}

#[test]
fn control_messages_round_trip() {
    let messages = vec![
        ControlMessage::Hello {
            is_little_endian: true,
            remote_network_version: 1033,
            encryption_token: String::new(),
        },
        ControlMessage::Welcome {
            map: "/Game/Maps/Arena/Arena_P".into(),
            game_name: "Arena".into(),
            redirect_url: String::new(),
        },
        ControlMessage::Upgrade {
            protocol_version: 1033,
        },
        ControlMessage::Challenge {
            challenge: "A5F20C99".into(),
        },
        ControlMessage::Netspeed { rate: 30000 },
        ControlMessage::Login {
            client_response: "0".into(),
            request_url: "/Game/Maps/Arena".into(),
            unique_id: "76561198000000000".into(),
            online_platform_name: "NULL".into(),
        },
        ControlMessage::Failure {
            reason: "Challenge mismatch".into(),
        },
        ControlMessage::Join,
    ];

    for message in messages {
        let mut w = BitWriter::resizable(128);
        message.encode(&mut w);
        let bytes = w.as_bytes().to_vec();
        let mut r = BitReader::new(&bytes, w.num_bits());
        assert_eq!(ControlMessage::decode(&mut r).unwrap(), message);
        assert!(!r.is_error());
    }
}

#[test]
fn unknown_control_tag_is_an_error() {
    let mut w = BitWriter::resizable(8);
    w.write_u8(42);
    let bytes = w.as_bytes().to_vec();
    let mut r = BitReader::new(&bytes, w.num_bits());
    assert_eq!(
        ControlMessage::decode(&mut r).unwrap_err(),
        ControlError::UnknownMessageType(42)
    );
}

#[test]
fn truncated_control_message_is_an_error() {
    let mut w = BitWriter::resizable(8);
    w.write_u8(3); // Challenge tag, but no string follows
    let bytes = w.as_bytes().to_vec();
    let mut r = BitReader::new(&bytes, w.num_bits());
    assert_eq!(
        ControlMessage::decode(&mut r).unwrap_err(),
        ControlError::Truncated
    );
}
