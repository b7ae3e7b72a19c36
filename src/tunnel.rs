use tracing::trace;

pub const TUNNEL_PORT: u16 = 5570;
pub const PACKET_VERSION: u8 = 0x02;
pub const HEADER_LEN: usize = 16;
pub const CHECKSUM_LEN: usize = 2;
pub const CONNECT_STATUS_OK: u32 = 0x0000_0001;
pub const CRYPTO_CLEARTEXT: u16 = 0x000A;

pub const DISCOVERY_REQUEST_TYPE: u32 = 0x0000_0001;
pub const DISCOVERY_RESPONSE_TYPE: u32 = 0x0080_0001;
/// Discovery replies carry the device id as null-terminated ASCII at this
/// fixed offset.
pub const DISCOVERY_ID_OFFSET: usize = 19;

/// Frame-control bytes inserted between header and payload on TAG frames.
const FRAME_CONTROL_TAG: [u8; 2] = [0x00, 0x03];
const PAYLOAD_TERMINATOR: u8 = 0x02;
const EMAIL_ID_TYPE: u8 = 0x01;
const IPX_LEN: usize = 17;

pub mod packet_type {
    pub const U_CONNECT: u8 = 0x83;
    pub const U_ALIVE: u8 = 0x82;
    pub const DATA: u8 = 0x16;
}

pub mod packet_flags {
    pub const RESPONSE: u8 = 0x01;
    pub const EXCEPTION: u8 = 0x02;
    pub const TAG: u8 = 0x40;
    pub const NSI_CO: u8 = 0x80;
}

pub mod payload_type {
    pub const IPX: u8 = 0x35;
    pub const CRYPT: u8 = 0x36;
    pub const CP_ID: u8 = 0x3F;
}

pub mod command {
    pub const PING: u8 = 0x11;
    pub const SETPOINT_READLIST: u8 = 0x2A;
    pub const SETPOINT_WRITELIST: u8 = 0x2B;
    pub const DATAPOINT_READLIST: u8 = 0x2D;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub client_id: u32,
    pub server_id: u32,
    pub packet_type: u8,
    pub flags: u8,
    pub sequence_id: u16,
    /// Total frame length, header and (on DATA frames) checksum included.
    pub length: u16,
}

impl Header {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buffer = [0u8; HEADER_LEN];
        buffer[0..4].copy_from_slice(&self.client_id.to_be_bytes());
        buffer[4..8].copy_from_slice(&self.server_id.to_be_bytes());
        buffer[8] = self.packet_type;
        buffer[9] = PACKET_VERSION;
        buffer[10] = 0;
        buffer[11] = self.flags;
        buffer[12..14].copy_from_slice(&self.sequence_id.to_be_bytes());
        buffer[14..16].copy_from_slice(&self.length.to_be_bytes());
        buffer
    }

    pub fn parse(frame: &[u8]) -> Option<Header> {
        if frame.len() < HEADER_LEN {
            return None;
        }
        Some(Header {
            client_id: read_u32(frame, 0),
            server_id: read_u32(frame, 4),
            packet_type: frame[8],
            flags: frame[11],
            sequence_id: read_u16(frame, 12),
            length: read_u16(frame, 14),
        })
    }
}

fn read_u32(frame: &[u8], offset: usize) -> u32 {
    match frame.get(offset..offset + 4) {
        Some(&[a, b, c, d]) => u32::from_be_bytes([a, b, c, d]),
        _ => 0,
    }
}

fn read_u16(frame: &[u8], offset: usize) -> u16 {
    match frame.get(offset..offset + 2) {
        Some(&[a, b]) => u16::from_be_bytes([a, b]),
        _ => 0,
    }
}

/// 16-bit sum of every byte in `frame`, the trailer of every DATA frame.
pub fn checksum(frame: &[u8]) -> u16 {
    frame
        .iter()
        .fold(0u16, |sum, byte| sum.wrapping_add(u16::from(*byte)))
}

pub fn build_discovery_request(device_id: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(13 + device_id.len());
    frame.extend(DISCOVERY_REQUEST_TYPE.to_be_bytes());
    frame.extend([0u8; 8]);
    frame.extend(device_id.as_bytes());
    frame.push(0);
    frame
}

/// Returns the announced device id, or `None` for anything that is not a
/// well-formed discovery reply. Stray datagrams are expected on 5570 and
/// must parse to `None` rather than error.
pub fn parse_discovery_response(frame: &[u8]) -> Option<String> {
    let (type_word, _) = frame.split_first_chunk::<4>()?;
    if u32::from_be_bytes(*type_word) != DISCOVERY_RESPONSE_TYPE {
        return None;
    }
    let id = frame.get(DISCOVERY_ID_OFFSET..)?;
    let id = match id.iter().position(|byte| *byte == 0) {
        Some(nul) => &id[..nul],
        None => id,
    };
    if id.is_empty() || !id.is_ascii() {
        return None;
    }
    String::from_utf8(id.to_vec()).ok()
}

/// U_CONNECT request: header, IPX payload (rendezvous disabled), CP_ID
/// payload carrying the paired email. No checksum on session frames.
pub fn build_connect_request(client_id: u32, email: &str) -> Vec<u8> {
    let cp_id_len = 5 + email.len();
    let length = HEADER_LEN + IPX_LEN + cp_id_len;
    let header = Header {
        client_id,
        server_id: 0,
        packet_type: packet_type::U_CONNECT,
        flags: 0,
        sequence_id: 0,
        length: length as u16,
    };
    let mut frame = Vec::with_capacity(length);
    frame.extend(header.to_bytes());
    frame.push(payload_type::IPX);
    frame.push(0);
    frame.extend((IPX_LEN as u16).to_be_bytes());
    frame.extend([0u8; 12]);
    frame.push(0x80);
    frame.push(payload_type::CP_ID);
    frame.push(0);
    frame.extend((cp_id_len as u16).to_be_bytes());
    frame.push(EMAIL_ID_TYPE);
    frame.extend(email.as_bytes());
    frame
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    pub status: u32,
    pub server_id: u32,
}

pub fn parse_connect_response(frame: &[u8]) -> Option<ConnectResponse> {
    let header = Header::parse(frame)?;
    if header.packet_type != packet_type::U_CONNECT {
        return None;
    }
    if header.flags & packet_flags::RESPONSE == 0 {
        return None;
    }
    if frame.len() < 28 {
        return None;
    }
    Some(ConnectResponse {
        status: read_u32(frame, 20),
        server_id: read_u32(frame, 24),
    })
}

/// DATA frame: header, optional frame-control tag, one CRYPT payload
/// wrapping `command` in cleartext, sum-of-bytes checksum.
///
/// The CRYPT payload's declared length historically counts the trailing
/// frame checksum as well, so it reads `9 + |command|` while the payload
/// itself occupies `7 + |command|` bytes on the wire.
pub fn build_data_packet(
    client_id: u32,
    server_id: u32,
    sequence_id: u16,
    flags: u8,
    command: &[u8],
) -> Vec<u8> {
    let tag_len = if flags & packet_flags::TAG != 0 { 2 } else { 0 };
    let payload_len = 7 + command.len();
    let length = HEADER_LEN + tag_len + payload_len + CHECKSUM_LEN;
    let header = Header {
        client_id,
        server_id,
        packet_type: packet_type::DATA,
        flags,
        sequence_id,
        length: length as u16,
    };
    let mut frame = Vec::with_capacity(length);
    frame.extend(header.to_bytes());
    if tag_len != 0 {
        frame.extend(FRAME_CONTROL_TAG);
    }
    frame.push(payload_type::CRYPT);
    frame.push(0);
    frame.extend(((payload_len + CHECKSUM_LEN) as u16).to_be_bytes());
    frame.extend(CRYPTO_CLEARTEXT.to_be_bytes());
    frame.extend(command);
    frame.push(PAYLOAD_TERMINATOR);
    frame.extend(checksum(&frame).to_be_bytes());
    frame
}

/// Locates the CRYPT payload of a DATA frame and returns the sequence id
/// together with the command bytes.
///
/// The extraction window is clamped to the frame end: the declared payload
/// length includes the checksum, so trusting it verbatim would read past
/// the datagram. The returned slice may carry the payload terminator and
/// checksum as a tail; command parsers only consume their declared counts.
pub fn parse_data_response(frame: &[u8]) -> Option<(u16, &[u8])> {
    let header = Header::parse(frame)?;
    if header.packet_type != packet_type::DATA {
        return None;
    }
    let offset = if header.flags & packet_flags::TAG != 0 {
        HEADER_LEN + 2
    } else {
        HEADER_LEN
    };
    let payload = frame.get(offset..)?;
    if payload.len() < 6 {
        return None;
    }
    if payload[0] != payload_type::CRYPT {
        trace!(message = "unexpected payload type", payload_type = payload[0]);
        return None;
    }
    // Only cleartext traffic exists on the LAN; anything else is refused.
    if read_u16(payload, 4) != CRYPTO_CLEARTEXT {
        trace!(message = "refusing non-cleartext payload");
        return None;
    }
    let declared = usize::from(read_u16(payload, 2));
    let end = (offset + 4 + declared).min(frame.len());
    if end < offset + 6 {
        return None;
    }
    Some((header.sequence_id, &frame[offset + 6..end]))
}

fn command_tag(cmd: u8) -> [u8; 4] {
    [0, 0, 0, cmd]
}

pub fn ping_command() -> Vec<u8> {
    let mut buffer = Vec::with_capacity(8);
    buffer.extend(command_tag(command::PING));
    buffer.extend(b"ping");
    buffer
}

pub fn datapoint_read_command(entries: &[(u8, u32)]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(7 + entries.len() * 5);
    buffer.extend(command_tag(command::DATAPOINT_READLIST));
    buffer.extend((entries.len() as u16).to_be_bytes());
    for (obj, address) in entries {
        buffer.push(*obj);
        buffer.extend(address.to_be_bytes());
    }
    buffer.push(0x01);
    buffer
}

pub fn setpoint_read_command(entries: &[(u8, u16)]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(7 + entries.len() * 3);
    buffer.extend(command_tag(command::SETPOINT_READLIST));
    buffer.extend((entries.len() as u16).to_be_bytes());
    for (obj, address) in entries {
        buffer.push(*obj);
        buffer.extend(address.to_be_bytes());
    }
    buffer.push(0x01);
    buffer
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetpointWrite {
    pub id: u8,
    pub value: u32,
    pub param: u16,
}

pub fn setpoint_write_command(writes: &[SetpointWrite]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(7 + writes.len() * 7);
    buffer.extend(command_tag(command::SETPOINT_WRITELIST));
    buffer.extend((writes.len() as u16).to_be_bytes());
    for write in writes {
        buffer.push(write.id);
        buffer.extend(write.value.to_be_bytes());
        buffer.extend(write.param.to_be_bytes());
    }
    buffer.push(0x01);
    buffer
}

/// Datapoint read replies: declared count, then that many signed 16-bit
/// values in request order. A truncated reply yields fewer values; the
/// caller re-associates positionally and leaves surplus keys unset.
pub fn parse_datapoint_values(command: &[u8]) -> Option<Vec<i16>> {
    let (count, mut values) = command.split_first_chunk::<2>()?;
    let count = usize::from(u16::from_be_bytes(*count));
    let mut result = Vec::with_capacity(count);
    while result.len() < count {
        let Some((value, remainder)) = values.split_first_chunk::<2>() else {
            break;
        };
        result.push(i16::from_be_bytes(*value));
        values = remainder;
    }
    Some(result)
}

/// Setpoint read replies carry one skip byte before the count; values are
/// unsigned.
pub fn parse_setpoint_values(command: &[u8]) -> Option<Vec<u16>> {
    let (_skip, command) = command.split_first()?;
    let (count, mut values) = command.split_first_chunk::<2>()?;
    let count = usize::from(u16::from_be_bytes(*count));
    let mut result = Vec::with_capacity(count);
    while result.len() < count {
        let Some((value, remainder)) = values.split_first_chunk::<2>() else {
            break;
        };
        result.push(u16::from_be_bytes(*value));
        values = remainder;
    }
    Some(result)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ModelInfo {
    pub device_number: u32,
    pub device_model: u32,
    pub slave_device_number: u32,
    pub slave_device_model: u32,
}

/// Fields missing from a short reply default to zero; the model info is
/// informational only.
pub fn parse_ping_response(command: &[u8]) -> ModelInfo {
    ModelInfo {
        device_number: read_u32(command, 0),
        device_model: read_u32(command, 4),
        slave_device_number: read_u32(command, 12),
        slave_device_model: read_u32(command, 16),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = Header {
            client_id: 0x11223344,
            server_id: 0xDEADBEEF,
            packet_type: packet_type::DATA,
            flags: packet_flags::RESPONSE | packet_flags::TAG,
            sequence_id: 300,
            length: 1234,
        };
        let parsed = Header::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn header_parse_rejects_short_input() {
        assert_eq!(Header::parse(&[0u8; 15]), None);
    }

    #[test]
    fn discovery_response_yields_device_id() {
        // 25-byte reply: response type word, arbitrary filler, then the
        // null-terminated id at offset 19.
        let mut frame = vec![0xAAu8; 25];
        frame[0..4].copy_from_slice(&[0x00, 0x80, 0x00, 0x01]);
        frame[19..24].copy_from_slice(b"ABCDE");
        frame[24] = 0x00;
        assert_eq!(parse_discovery_response(&frame).as_deref(), Some("ABCDE"));
    }

    #[test]
    fn discovery_request_is_rejected_as_response() {
        let frame = build_discovery_request("*");
        assert_eq!(parse_discovery_response(&frame), None);
    }

    #[test]
    fn connect_request_layout() {
        let frame = build_connect_request(0x11223344, "a@b");
        let header = Header::parse(&frame).unwrap();
        assert_eq!(header.client_id, 0x11223344);
        assert_eq!(header.server_id, 0);
        assert_eq!(header.packet_type, packet_type::U_CONNECT);
        assert_eq!(header.sequence_id, 0);
        assert_eq!(usize::from(header.length), frame.len());
        // IPX payload: 17 bytes ending in the rendezvous-disabled marker.
        assert_eq!(frame[16], payload_type::IPX);
        assert_eq!(frame[32], 0x80);
        // CP_ID payload: email id type then the email itself.
        assert_eq!(frame[33], payload_type::CP_ID);
        assert_eq!(frame[37], 0x01);
        assert_eq!(&frame[38..], b"a@b");
    }

    #[test]
    fn connect_response_carries_status_and_server_id() {
        let mut frame = Header {
            client_id: 0x11223344,
            server_id: 0,
            packet_type: packet_type::U_CONNECT,
            flags: packet_flags::RESPONSE,
            sequence_id: 0,
            length: 28,
        }
        .to_bytes()
        .to_vec();
        frame.extend([0u8; 4]);
        frame.extend(CONNECT_STATUS_OK.to_be_bytes());
        frame.extend([0xDE, 0xAD, 0xBE, 0xEF]);
        let response = parse_connect_response(&frame).unwrap();
        assert_eq!(response.status, CONNECT_STATUS_OK);
        assert_eq!(response.server_id, 0xDEADBEEF);
    }

    #[test]
    fn connect_response_without_response_flag_is_dropped() {
        let mut frame = Header {
            client_id: 1,
            server_id: 0,
            packet_type: packet_type::U_CONNECT,
            flags: 0,
            sequence_id: 0,
            length: 28,
        }
        .to_bytes()
        .to_vec();
        frame.extend([0u8; 12]);
        assert_eq!(parse_connect_response(&frame), None);
    }

    #[test]
    fn crypt_payload_declares_length_with_checksum() {
        let command = ping_command();
        let frame = build_data_packet(1, 2, 300, 0, &command);
        let declared = u16::from_be_bytes([frame[18], frame[19]]);
        assert_eq!(usize::from(declared), 9 + command.len());
        assert_eq!(frame[frame.len() - 3], 0x02);
        let header = Header::parse(&frame).unwrap();
        assert_eq!(usize::from(header.length), frame.len());
    }

    #[test]
    fn data_packet_checksum_sums_preceding_bytes() {
        let frame = build_data_packet(7, 8, 301, 0, &ping_command());
        let trailer = u16::from_be_bytes([frame[frame.len() - 2], frame[frame.len() - 1]]);
        assert_eq!(trailer, checksum(&frame[..frame.len() - 2]));
    }

    #[test]
    fn data_response_extraction_round_trips() {
        let command = datapoint_read_command(&[(0, 20), (0, 21)]);
        let frame = build_data_packet(1, 2, 305, 0, &command);
        let (seq, extracted) = parse_data_response(&frame).unwrap();
        assert_eq!(seq, 305);
        // The clamp keeps the terminator and checksum as a harmless tail.
        assert!(extracted.starts_with(&command));
        assert_eq!(extracted.len(), command.len() + 3);
    }

    #[test]
    fn tagged_frame_shifts_the_payload() {
        let command = ping_command();
        let frame = build_data_packet(1, 2, 150, packet_flags::TAG, &command);
        assert_eq!(&frame[16..18], &[0x00, 0x03]);
        let (seq, extracted) = parse_data_response(&frame).unwrap();
        assert_eq!(seq, 150);
        assert!(extracted.starts_with(&command));
    }

    #[test]
    fn non_cleartext_payloads_are_refused() {
        let mut frame = build_data_packet(1, 2, 300, 0, &ping_command());
        frame[20..22].copy_from_slice(&0x1000u16.to_be_bytes());
        assert_eq!(parse_data_response(&frame), None);
    }

    #[test]
    fn non_data_frames_are_not_responses() {
        let frame = build_connect_request(1, "a@b");
        assert_eq!(parse_data_response(&frame), None);
    }

    #[test]
    fn datapoint_read_command_layout() {
        let buffer = datapoint_read_command(&[(0, 20), (1, 0x01020304)]);
        assert_eq!(&buffer[..4], &[0, 0, 0, command::DATAPOINT_READLIST]);
        assert_eq!(&buffer[4..6], &[0, 2]);
        assert_eq!(&buffer[6..11], &[0, 0, 0, 0, 20]);
        assert_eq!(&buffer[11..16], &[1, 1, 2, 3, 4]);
        assert_eq!(buffer[16], 0x01);
    }

    #[test]
    fn setpoint_write_command_layout() {
        let buffer = setpoint_write_command(&[SetpointWrite {
            id: 0,
            value: 120,
            param: 12,
        }]);
        assert_eq!(&buffer[..4], &[0, 0, 0, command::SETPOINT_WRITELIST]);
        assert_eq!(&buffer[4..6], &[0, 1]);
        assert_eq!(&buffer[6..13], &[0, 0, 0, 0, 120, 0, 12]);
        assert_eq!(buffer[13], 0x01);
    }

    #[test]
    fn datapoint_values_demux_in_order() {
        let command = [
            0x00, 0x03, 0x00, 0xD2, 0xFF, 0x9C, 0x00, 0x2D, // count=3: 210, -100, 45
        ];
        assert_eq!(
            parse_datapoint_values(&command).unwrap(),
            vec![210, -100, 45]
        );
    }

    #[test]
    fn short_datapoint_reply_yields_fewer_values() {
        // Declared count 12, only 11 values actually present.
        let command = [
            0x00, 0x0C, 0x00, 0xD2, 0x00, 0xC8, 0x00, 0xD6, 0x00, 0xE0, 0x00, 0x2D, 0x00, 0x32,
            0x00, 0x28, 0x00, 0xA0, 0x00, 0x64, 0x00, 0x00, 0x00, 0x00,
        ];
        let values = parse_datapoint_values(&command).unwrap();
        assert_eq!(values.len(), 11);
        assert_eq!(values[..3], [210, 200, 214]);
    }

    #[test]
    fn setpoint_values_skip_the_lead_byte() {
        let command = [0xFF, 0x00, 0x02, 0x00, 0x78, 0x00, 0x01];
        assert_eq!(parse_setpoint_values(&command).unwrap(), vec![120, 1]);
    }

    #[test]
    fn ping_response_defaults_missing_fields() {
        let mut command = Vec::new();
        command.extend(77u32.to_be_bytes());
        command.extend(2010u32.to_be_bytes());
        assert_eq!(
            parse_ping_response(&command),
            ModelInfo {
                device_number: 77,
                device_model: 2010,
                slave_device_number: 0,
                slave_device_model: 0,
            }
        );
    }

    #[test]
    fn ping_response_reads_all_four_fields() {
        let mut command = Vec::new();
        for word in [1u32, 2, 3, 4, 5] {
            command.extend(word.to_be_bytes());
        }
        let info = parse_ping_response(&command);
        assert_eq!(info.device_number, 1);
        assert_eq!(info.device_model, 2);
        assert_eq!(info.slave_device_number, 4);
        assert_eq!(info.slave_device_model, 5);
    }
}
