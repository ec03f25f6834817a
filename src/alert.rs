use crate::error::Result;
use crate::parsing::ByteReader;

tls_struct!(Alert => {
    AlertLevel level;
    AlertDescription description;
});

impl Alert {
    pub fn fatal(description: AlertDescription) -> Self {
        Self {
            level: AlertLevel::fatal,
            description,
        }
    }

    pub fn warning(description: AlertDescription) -> Self {
        Self {
            level: AlertLevel::warning,
            description,
        }
    }
}

tls_enum_u8!(AlertLevel => {
    warning(1), fatal(2), (255)
});

tls_enum_u8!(AlertDescription => {
    close_notify(0),
    unexpected_message(10),
    bad_record_mac(20),
    decryption_failed(21),
    record_overflow(22),
    handshake_failure(40),
    bad_certificate(42),
    unsupported_certificate(43),
    certificate_revoked(44),
    certificate_expired(45),
    certificate_unknown(46),
    illegal_parameter(47),
    unknown_ca(48),
    access_denied(49),
    decode_error(50),
    decrypt_error(51),
    protocol_version(70),
    insufficient_security(71),
    internal_error(80),
    inappropriate_fallback(86),
    user_canceled(90),
    no_renegotiation(100),
    missing_extension(109),
    unsupported_extension(110),
    unrecognized_name(112),
    bad_certificate_status_response(113),
    unknown_psk_identity(115),
    certificate_required(116),
    no_application_protocol(120),
    (255)
});
