use crate::datatypes::CommandId;
use crate::macros::impl_complete_header_only_pdu;

/// The enquire_link PDU is used to check that the application at the other
/// end of the session is still active. It can be sent by either an ESME or
/// the SMSC at any point after a successful bind.
#[derive(Clone, Debug, PartialEq)]
pub struct EnquireLink {
    // pub command_length: u32,
    // pub command_id: CommandId::EnquireLink,
    pub command_status: crate::datatypes::CommandStatus,
    pub sequence_number: u32,
}

/// Response to enquire_link; carries no body.
#[derive(Clone, Debug, PartialEq)]
pub struct EnquireLinkResponse {
    // pub command_length: u32,
    // pub command_id: CommandId::EnquireLinkResp,
    pub command_status: crate::datatypes::CommandStatus,
    pub sequence_number: u32,
}

impl_complete_header_only_pdu!(EnquireLink, CommandId::EnquireLink);
impl_complete_header_only_pdu!(EnquireLinkResponse, CommandId::EnquireLinkResp);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Decodable, Encodable, PduHeader};
    use std::io::Cursor;

    #[test]
    fn enquire_link_roundtrip() {
        let original = EnquireLink::new(42);
        let bytes = original.to_bytes();

        let mut cursor = Cursor::new(bytes.as_ref());
        let header = PduHeader::decode(&mut cursor).unwrap();
        let decoded = EnquireLink::decode(header, &mut cursor).unwrap();

        assert_eq!(original, decoded);
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn enquire_link_resp_roundtrip() {
        let original = EnquireLinkResponse::new(7);
        let bytes = original.to_bytes();

        let mut cursor = Cursor::new(bytes.as_ref());
        let header = PduHeader::decode(&mut cursor).unwrap();
        let decoded = EnquireLinkResponse::decode(header, &mut cursor).unwrap();

        assert_eq!(original, decoded);
    }
}
