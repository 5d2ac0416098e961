use crate::codec::{
    CodecError, Decodable, Encodable, PduHeader, decode_cstring, decode_u8, encode_cstring,
    encode_u8,
};
use crate::datatypes::numeric_plan_indicator::NumericPlanIndicator;
use crate::datatypes::tlv::{Tlv, tags};
use crate::datatypes::{
    CommandId, CommandStatus, DataCoding, DestinationAddr, EsmClass, MessageId,
    ScheduleDeliveryTime, ServiceType, ShortMessage, SourceAddr, TypeOfNumber, ValidityPeriod,
};
use bytes::BytesMut;
use std::io::Cursor;

/// This operation is used by an ESME to submit a short message to the SMSC for onward
/// transmission to a specified short message entity (SME). The submit_sm PDU does not
/// support the transaction message mode.
#[derive(Clone, Debug, PartialEq)]
pub struct SubmitSm {
    // pub command_length: u32,
    // pub command_id: CommandId::SubmitSm,
    pub command_status: CommandStatus,
    pub sequence_number: u32,

    // Mandatory parameters
    /// 4.4.1 service_type: the SMS Application service associated with the message.
    pub service_type: ServiceType,

    /// 4.4.2 source_addr_ton: Type of Number for source address.
    pub source_addr_ton: TypeOfNumber,

    /// 4.4.3 source_addr_npi: Numbering Plan Indicator for source address.
    pub source_addr_npi: NumericPlanIndicator,

    /// 4.4.4 source_addr: address of SME originating this message.
    pub source_addr: SourceAddr,

    /// 4.4.5 dest_addr_ton: Type of Number for destination address.
    pub dest_addr_ton: TypeOfNumber,

    /// 4.4.6 dest_addr_npi: Numbering Plan Indicator for destination address.
    pub dest_addr_npi: NumericPlanIndicator,

    /// 4.4.7 destination_addr: destination address of this short message.
    pub destination_addr: DestinationAddr,

    /// 4.4.8 esm_class: Message Mode and Message Type bitfield.
    pub esm_class: EsmClass,

    /// 4.4.9 protocol_id: network specific protocol identifier.
    pub protocol_id: u8,

    /// 4.4.10 priority_flag: message priority level (0-3).
    pub priority_flag: u8,

    /// 4.4.11 schedule_delivery_time: scheduled delivery time, NULL for immediate.
    pub schedule_delivery_time: ScheduleDeliveryTime,

    /// 4.4.12 validity_period: validity period of the message.
    pub validity_period: ValidityPeriod,

    /// 4.4.13 registered_delivery: delivery receipt / acknowledgment request.
    pub registered_delivery: u8,

    /// 4.4.14 replace_if_present_flag: requests replacement of a prior message.
    pub replace_if_present_flag: u8,

    /// 4.4.15 data_coding: encoding scheme of the short message user data.
    pub data_coding: DataCoding,

    /// 4.4.16 sm_default_msg_id: pre-defined message reference.
    pub sm_default_msg_id: u8,

    /// 4.4.17 sm_length: length in octets of short_message.
    pub sm_length: u8,

    /// 4.4.18 short_message: up to 254 octets of user data.
    pub short_message: ShortMessage,

    // Optional parameters (TLV format)
    pub user_message_reference: Option<Tlv>,
    pub source_port: Option<Tlv>,
    pub source_addr_submit: Option<Tlv>,
    pub destination_port: Option<Tlv>,
    pub dest_addr_submit: Option<Tlv>,
    pub sar_msg_ref_num: Option<Tlv>,
    pub sar_total_segments: Option<Tlv>,
    pub sar_segment_seqnum: Option<Tlv>,
    pub more_messages_to_send: Option<Tlv>,
    pub payload_type: Option<Tlv>,
    pub message_payload: Option<Tlv>,
    pub privacy_indicator: Option<Tlv>,
    pub callback_num: Option<Tlv>,
    pub callback_num_pres_ind: Option<Tlv>,
    pub callback_num_atag: Option<Tlv>,
    pub source_subaddress: Option<Tlv>,
    pub dest_subaddress: Option<Tlv>,
    pub display_time: Option<Tlv>,
    pub sms_signal: Option<Tlv>,
    pub ms_validity: Option<Tlv>,
    pub ms_msg_wait_facilities: Option<Tlv>,
    pub number_of_messages: Option<Tlv>,
    pub alert_on_msg_delivery: Option<Tlv>,
    pub language_indicator: Option<Tlv>,
    pub its_reply_type: Option<Tlv>,
    pub its_session_info: Option<Tlv>,
    pub ussd_service_op: Option<Tlv>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitSmValidationError {
    #[error("short_message exceeds 254 octets")]
    ShortMessageTooLong,
}

/// The submit_sm_resp PDU is used to provide a response to the submit_sm request.
#[derive(Clone, Debug, PartialEq)]
pub struct SubmitSmResponse {
    // pub command_length: u32,
    // pub command_id: CommandId::SubmitSmResp,
    pub command_status: CommandStatus,
    pub sequence_number: u32,

    // Body
    /// 4.4.1 message_id: SMSC message ID of the submitted message, used for delivery
    /// receipt correlation.
    pub message_id: MessageId,
}

impl Decodable for SubmitSm {
    fn command_id() -> CommandId {
        CommandId::SubmitSm
    }

    fn decode(header: PduHeader, buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        use bytes::Buf;

        Self::validate_header(&header)?;

        let service_type_str = decode_cstring(buf, 6, "service_type")?;
        let source_addr_ton =
            TypeOfNumber::try_from(decode_u8(buf)?).map_err(|_| CodecError::FieldValidation {
                field: "source_addr_ton",
                reason: "Invalid type of number".to_string(),
            })?;
        let source_addr_npi = NumericPlanIndicator::try_from(decode_u8(buf)?).map_err(|_| {
            CodecError::FieldValidation {
                field: "source_addr_npi",
                reason: "Invalid numbering plan indicator".to_string(),
            }
        })?;
        let source_addr_str = decode_cstring(buf, 21, "source_addr")?;
        let dest_addr_ton =
            TypeOfNumber::try_from(decode_u8(buf)?).map_err(|_| CodecError::FieldValidation {
                field: "dest_addr_ton",
                reason: "Invalid type of number".to_string(),
            })?;
        let dest_addr_npi = NumericPlanIndicator::try_from(decode_u8(buf)?).map_err(|_| {
            CodecError::FieldValidation {
                field: "dest_addr_npi",
                reason: "Invalid numbering plan indicator".to_string(),
            }
        })?;
        let destination_addr_str = decode_cstring(buf, 21, "destination_addr")?;
        let esm_class_byte = decode_u8(buf)?;
        let protocol_id = decode_u8(buf)?;
        let priority_flag = decode_u8(buf)?;
        let schedule_delivery_time_str = decode_cstring(buf, 17, "schedule_delivery_time")?;
        let validity_period_str = decode_cstring(buf, 17, "validity_period")?;
        let registered_delivery = decode_u8(buf)?;
        let replace_if_present_flag = decode_u8(buf)?;
        let data_coding_byte = decode_u8(buf)?;
        let sm_default_msg_id = decode_u8(buf)?;
        let sm_length = decode_u8(buf)?;

        if buf.remaining() < sm_length as usize {
            return Err(CodecError::Incomplete);
        }
        let short_message_bytes = buf.copy_to_bytes(sm_length as usize);

        let service_type = ServiceType::new(&service_type_str).map_err(|e| {
            CodecError::FieldValidation {
                field: "service_type",
                reason: e.to_string(),
            }
        })?;
        let source_addr = SourceAddr::new(&source_addr_str, source_addr_ton).map_err(|e| {
            CodecError::FieldValidation {
                field: "source_addr",
                reason: e.to_string(),
            }
        })?;
        let destination_addr =
            DestinationAddr::new(&destination_addr_str, dest_addr_ton).map_err(|e| {
                CodecError::FieldValidation {
                    field: "destination_addr",
                    reason: e.to_string(),
                }
            })?;
        let esm_class = EsmClass::from(esm_class_byte);
        let schedule_delivery_time = ScheduleDeliveryTime::new(&schedule_delivery_time_str)
            .map_err(|e| CodecError::FieldValidation {
                field: "schedule_delivery_time",
                reason: e.to_string(),
            })?;
        let validity_period = ValidityPeriod::new(&validity_period_str).map_err(|e| {
            CodecError::FieldValidation {
                field: "validity_period",
                reason: e.to_string(),
            }
        })?;
        let data_coding = DataCoding::from(data_coding_byte);
        // Built from the raw octets, not a UTF-8 string: the payload may be
        // packed GSM-7 septets, UCS-2 code units, or Latin-1 — none of
        // which round-trip through `String::from_utf8_lossy` intact.
        let short_message = ShortMessage::new(&short_message_bytes).map_err(|e| {
            CodecError::FieldValidation {
                field: "short_message",
                reason: e.to_string(),
            }
        })?;

        let mut pdu = SubmitSm {
            command_status: header.command_status,
            sequence_number: header.sequence_number,
            service_type,
            source_addr_ton,
            source_addr_npi,
            source_addr,
            dest_addr_ton,
            dest_addr_npi,
            destination_addr,
            esm_class,
            protocol_id,
            priority_flag,
            schedule_delivery_time,
            validity_period,
            registered_delivery,
            replace_if_present_flag,
            data_coding,
            sm_default_msg_id,
            sm_length,
            short_message,
            user_message_reference: None,
            source_port: None,
            source_addr_submit: None,
            destination_port: None,
            dest_addr_submit: None,
            sar_msg_ref_num: None,
            sar_total_segments: None,
            sar_segment_seqnum: None,
            more_messages_to_send: None,
            payload_type: None,
            message_payload: None,
            privacy_indicator: None,
            callback_num: None,
            callback_num_pres_ind: None,
            callback_num_atag: None,
            source_subaddress: None,
            dest_subaddress: None,
            display_time: None,
            sms_signal: None,
            ms_validity: None,
            ms_msg_wait_facilities: None,
            number_of_messages: None,
            alert_on_msg_delivery: None,
            language_indicator: None,
            its_reply_type: None,
            its_session_info: None,
            ussd_service_op: None,
        };

        // Trailing optional TLVs; unrecognized tags are skipped (forward compatibility)
        while buf.remaining() >= 4 {
            let tlv = Tlv::decode(buf)?;
            match tlv.tag {
                tags::USER_MESSAGE_REFERENCE => pdu.user_message_reference = Some(tlv),
                tags::SOURCE_PORT => pdu.source_port = Some(tlv),
                tags::SOURCE_ADDR_SUBMIT => pdu.source_addr_submit = Some(tlv),
                tags::DESTINATION_PORT => pdu.destination_port = Some(tlv),
                tags::DEST_ADDR_SUBMIT => pdu.dest_addr_submit = Some(tlv),
                tags::SAR_MSG_REF_NUM => pdu.sar_msg_ref_num = Some(tlv),
                tags::SAR_TOTAL_SEGMENTS => pdu.sar_total_segments = Some(tlv),
                tags::SAR_SEGMENT_SEQNUM => pdu.sar_segment_seqnum = Some(tlv),
                tags::MORE_MESSAGES_TO_SEND => pdu.more_messages_to_send = Some(tlv),
                tags::PAYLOAD_TYPE => pdu.payload_type = Some(tlv),
                tags::MESSAGE_PAYLOAD => pdu.message_payload = Some(tlv),
                tags::PRIVACY_INDICATOR => pdu.privacy_indicator = Some(tlv),
                tags::CALLBACK_NUM => pdu.callback_num = Some(tlv),
                tags::CALLBACK_NUM_PRES_IND => pdu.callback_num_pres_ind = Some(tlv),
                tags::CALLBACK_NUM_ATAG => pdu.callback_num_atag = Some(tlv),
                tags::SOURCE_SUBADDRESS => pdu.source_subaddress = Some(tlv),
                tags::DEST_SUBADDRESS => pdu.dest_subaddress = Some(tlv),
                tags::DISPLAY_TIME => pdu.display_time = Some(tlv),
                tags::SMS_SIGNAL => pdu.sms_signal = Some(tlv),
                tags::MS_VALIDITY => pdu.ms_validity = Some(tlv),
                tags::MS_MSG_WAIT_FACILITIES => pdu.ms_msg_wait_facilities = Some(tlv),
                tags::NUMBER_OF_MESSAGES => pdu.number_of_messages = Some(tlv),
                tags::ALERT_ON_MSG_DELIVERY => pdu.alert_on_msg_delivery = Some(tlv),
                tags::LANGUAGE_INDICATOR => pdu.language_indicator = Some(tlv),
                tags::ITS_REPLY_TYPE => pdu.its_reply_type = Some(tlv),
                tags::ITS_SESSION_INFO => pdu.its_session_info = Some(tlv),
                tags::USSD_SERVICE_OP => pdu.ussd_service_op = Some(tlv),
                other => {
                    tracing::debug!(tag = format!("{other:#x}"), "ignoring unknown submit_sm TLV");
                }
            }
        }

        Ok(pdu)
    }
}

impl Encodable for SubmitSm {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let header = PduHeader {
            command_length: 0, // fixed up by to_bytes()
            command_id: CommandId::SubmitSm,
            command_status: self.command_status,
            sequence_number: self.sequence_number,
        };
        header.encode(buf)?;

        encode_cstring(buf, &self.service_type.to_string(), 6);
        encode_u8(buf, self.source_addr_ton as u8);
        encode_u8(buf, self.source_addr_npi as u8);
        encode_cstring(buf, self.source_addr.as_str().unwrap_or(""), 21);
        encode_u8(buf, self.dest_addr_ton as u8);
        encode_u8(buf, self.dest_addr_npi as u8);
        encode_cstring(buf, self.destination_addr.as_str().unwrap_or(""), 21);
        encode_u8(buf, self.esm_class.into());
        encode_u8(buf, self.protocol_id);
        encode_u8(buf, self.priority_flag);
        encode_cstring(buf, &self.schedule_delivery_time.to_string(), 17);
        encode_cstring(buf, &self.validity_period.to_string(), 17);
        encode_u8(buf, self.registered_delivery);
        encode_u8(buf, self.replace_if_present_flag);
        encode_u8(buf, self.data_coding.to_byte());
        encode_u8(buf, self.sm_default_msg_id);
        encode_u8(buf, self.sm_length);
        buf.extend_from_slice(self.short_message.as_bytes());

        crate::macros::encode_optional_tlvs!(
            self,
            buf,
            user_message_reference,
            source_port,
            source_addr_submit,
            destination_port,
            dest_addr_submit,
            sar_msg_ref_num,
            sar_total_segments,
            sar_segment_seqnum,
            more_messages_to_send,
            payload_type,
            message_payload,
            privacy_indicator,
            callback_num,
            callback_num_pres_ind,
            callback_num_atag,
            source_subaddress,
            dest_subaddress,
            display_time,
            sms_signal,
            ms_validity,
            ms_msg_wait_facilities,
            number_of_messages,
            alert_on_msg_delivery,
            language_indicator,
            its_reply_type,
            its_session_info,
            ussd_service_op,
        );

        Ok(())
    }

    fn encoded_size(&self) -> usize {
        let mut size = PduHeader::SIZE
            + 6
            + 1
            + 1
            + 21
            + 1
            + 1
            + 21
            + 1
            + 1
            + 1
            + 17
            + 17
            + 1
            + 1
            + 1
            + 1
            + 1
            + self.short_message.as_bytes().len();

        crate::macros::size_optional_tlvs!(
            size,
            self,
            user_message_reference,
            source_port,
            source_addr_submit,
            destination_port,
            dest_addr_submit,
            sar_msg_ref_num,
            sar_total_segments,
            sar_segment_seqnum,
            more_messages_to_send,
            payload_type,
            message_payload,
            privacy_indicator,
            callback_num,
            callback_num_pres_ind,
            callback_num_atag,
            source_subaddress,
            dest_subaddress,
            display_time,
            sms_signal,
            ms_validity,
            ms_msg_wait_facilities,
            number_of_messages,
            alert_on_msg_delivery,
            language_indicator,
            its_reply_type,
            its_session_info,
            ussd_service_op,
        );

        size
    }
}

impl Decodable for SubmitSmResponse {
    fn command_id() -> CommandId {
        CommandId::SubmitSmResp
    }

    fn decode(header: PduHeader, buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        Self::validate_header(&header)?;

        let message_id_str = decode_cstring(buf, 65, "message_id")?;
        let message_id =
            MessageId::from_parsed_string(message_id_str).map_err(|e| CodecError::FieldValidation {
                field: "message_id",
                reason: e.to_string(),
            })?;

        Ok(SubmitSmResponse {
            command_status: header.command_status,
            sequence_number: header.sequence_number,
            message_id,
        })
    }
}

impl Encodable for SubmitSmResponse {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let header = PduHeader {
            command_length: 0,
            command_id: CommandId::SubmitSmResp,
            command_status: self.command_status,
            sequence_number: self.sequence_number,
        };
        header.encode(buf)?;

        encode_cstring(buf, self.message_id.as_str().unwrap_or(""), 65);

        Ok(())
    }

    fn encoded_size(&self) -> usize {
        PduHeader::SIZE + 65
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_submit_sm() -> SubmitSm {
        SubmitSm {
            command_status: CommandStatus::Ok,
            sequence_number: 7,
            service_type: ServiceType::new("").unwrap(),
            source_addr_ton: TypeOfNumber::International,
            source_addr_npi: NumericPlanIndicator::Isdn,
            source_addr: SourceAddr::new("12025550123", TypeOfNumber::International).unwrap(),
            dest_addr_ton: TypeOfNumber::International,
            dest_addr_npi: NumericPlanIndicator::Isdn,
            destination_addr: DestinationAddr::new("12025550199", TypeOfNumber::International)
                .unwrap(),
            esm_class: EsmClass::default(),
            protocol_id: 0,
            priority_flag: 0,
            schedule_delivery_time: ScheduleDeliveryTime::new("").unwrap(),
            validity_period: ValidityPeriod::new("").unwrap(),
            registered_delivery: 1,
            replace_if_present_flag: 0,
            data_coding: DataCoding::default(),
            sm_default_msg_id: 0,
            sm_length: 11,
            short_message: ShortMessage::from("Hello World"),
            user_message_reference: None,
            source_port: None,
            source_addr_submit: None,
            destination_port: None,
            dest_addr_submit: None,
            sar_msg_ref_num: None,
            sar_total_segments: None,
            sar_segment_seqnum: None,
            more_messages_to_send: None,
            payload_type: None,
            message_payload: None,
            privacy_indicator: None,
            callback_num: None,
            callback_num_pres_ind: None,
            callback_num_atag: None,
            source_subaddress: None,
            dest_subaddress: None,
            display_time: None,
            sms_signal: None,
            ms_validity: None,
            ms_msg_wait_facilities: None,
            number_of_messages: None,
            alert_on_msg_delivery: None,
            language_indicator: None,
            its_reply_type: None,
            its_session_info: None,
            ussd_service_op: None,
        }
    }

    #[test]
    fn submit_sm_roundtrip() {
        let original = sample_submit_sm();
        let bytes = Encodable::to_bytes(&original);

        let mut cursor = Cursor::new(bytes.as_ref());
        let header = PduHeader::decode(&mut cursor).unwrap();
        let decoded = SubmitSm::decode(header, &mut cursor).unwrap();

        assert_eq!(original, decoded);
    }

    #[test]
    fn submit_sm_roundtrip_preserves_non_utf8_short_message() {
        // UCS-2 payload: not valid UTF-8 on its own, and a lossy decode path
        // would both replace the invalid bytes and change their count.
        let ucs2_bytes: &[u8] = &[0x00, 0x48, 0xD8, 0x00, 0xDC, 0x00];
        let mut original = sample_submit_sm();
        original.data_coding = DataCoding::Ucs2;
        original.short_message = ShortMessage::new(ucs2_bytes).unwrap();
        original.sm_length = original.short_message.len();

        let bytes = Encodable::to_bytes(&original);
        let mut cursor = Cursor::new(bytes.as_ref());
        let header = PduHeader::decode(&mut cursor).unwrap();
        let decoded = SubmitSm::decode(header, &mut cursor).unwrap();

        assert_eq!(decoded.short_message.as_bytes(), ucs2_bytes);
        assert_eq!(original, decoded);
    }

    #[test]
    fn submit_sm_resp_roundtrip() {
        let original = SubmitSmResponse {
            command_status: CommandStatus::Ok,
            sequence_number: 7,
            message_id: MessageId::from("abc123"),
        };
        let bytes = Encodable::to_bytes(&original);

        let mut cursor = Cursor::new(bytes.as_ref());
        let header = PduHeader::decode(&mut cursor).unwrap();
        let decoded = SubmitSmResponse::decode(header, &mut cursor).unwrap();

        assert_eq!(original, decoded);
    }
}
