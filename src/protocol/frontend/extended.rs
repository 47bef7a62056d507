//! Extended query protocol messages.

use crate::protocol::codec::MessageBuilder;
use crate::protocol::types::{FormatCode, Oid};
use crate::types::Param;

/// Write a Parse message for the unnamed statement.
///
/// - `query`: SQL query with $1, $2, ... placeholders
/// - `param_oids`: Parameter type OIDs (0 = let server infer)
pub fn write_parse(buf: &mut Vec<u8>, query: &str, param_oids: &[Oid]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PARSE);
    msg.write_cstr("");
    msg.write_cstr(query);
    msg.write_i16(param_oids.len() as i16);
    for &oid in param_oids {
        msg.write_i32(oid as i32);
    }
    msg.finish();
}

/// Write a Bind message for the unnamed portal and statement.
///
/// Results are always requested in text format.
pub fn write_bind(buf: &mut Vec<u8>, params: &[Param]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::BIND);
    msg.write_cstr("");
    msg.write_cstr("");

    msg.write_i16(params.len() as i16);
    for param in params {
        msg.write_i16(param.format as i16);
    }

    msg.write_i16(params.len() as i16);
    for param in params {
        match &param.value {
            Some(value) => {
                msg.write_i32(value.len() as i32);
                msg.write_bytes(value);
            }
            None => msg.write_i32(-1),
        }
    }

    msg.write_i16(1);
    msg.write_i16(FormatCode::Text as i16);
    msg.finish();
}

/// Write a Describe message for the unnamed portal.
pub fn write_describe_portal(buf: &mut Vec<u8>) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::DESCRIBE);
    msg.write_u8(b'P');
    msg.write_cstr("");
    msg.finish();
}

/// Write an Execute message for the unnamed portal with no row limit.
pub fn write_execute(buf: &mut Vec<u8>) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::EXECUTE);
    msg.write_cstr("");
    msg.write_i32(0);
    msg.finish();
}

/// Write a Sync message.
///
/// This ends an extended query sequence and causes:
/// - Implicit COMMIT if successful and not in explicit transaction
/// - Implicit ROLLBACK if failed and not in explicit transaction
/// - Server responds with ReadyForQuery
pub fn write_sync(buf: &mut Vec<u8>) {
    let msg = MessageBuilder::new(buf, super::msg_type::SYNC);
    msg.finish();
}

/// Write the Parse/Bind/Describe/Execute sequence for one command.
pub fn write_query_unnamed(buf: &mut Vec<u8>, query: &str, params: &[Param]) {
    let oids: Vec<Oid> = params.iter().map(|p| p.oid).collect();
    write_parse(buf, query, &oids);
    write_bind(buf, params);
    write_describe_portal(buf);
    write_execute(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_length_field() {
        let mut buf = Vec::new();
        write_parse(&mut buf, "SELECT $1::int", &[0]);

        assert_eq!(buf[0], b'P');

        // Verify length field
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len as usize, buf.len() - 1);
    }

    #[test]
    fn bind_null_and_value() {
        let mut buf = Vec::new();
        write_bind(&mut buf, &[Param::text("ab"), Param::null()]);
        assert_eq!(buf[0], b'B');
        // portal "", statement "", 2 formats, 2 values
        let body = &buf[5..];
        assert_eq!(&body[..2], &[0, 0]);
        assert_eq!(&body[2..4], &2_i16.to_be_bytes());
        // value section: count, len 2 "ab", len -1
        assert_eq!(&body[8..10], &2_i16.to_be_bytes());
        assert_eq!(&body[10..14], &2_i32.to_be_bytes());
        assert_eq!(&body[14..16], b"ab");
        assert_eq!(&body[16..20], &(-1_i32).to_be_bytes());
    }

    #[test]
    fn sync_message_layout() {
        let mut buf = Vec::new();
        write_sync(&mut buf);

        assert_eq!(buf.len(), 5);
        assert_eq!(buf[0], b'S');
        assert_eq!(&buf[1..5], &4_i32.to_be_bytes());
    }

    #[test]
    fn unnamed_sequence_order() {
        let mut buf = Vec::new();
        write_query_unnamed(&mut buf, "SELECT 1", &[]);
        let mut types = Vec::new();
        let mut rest = &buf[..];
        while !rest.is_empty() {
            types.push(rest[0]);
            let len = i32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
            rest = &rest[1 + len..];
        }
        assert_eq!(types, b"PBDE");
    }
}
