use bytes::Bytes;

use crate::extensions::*;

macro_rules! find_extension {
    ($name:ident, $case:ident, $ret:ty) => {
        pub fn $name(extensions: &[Extension]) -> Option<&$ret> {
            for e in extensions {
                if let Extension::$case(v) = e {
                    return Some(v);
                }
            }

            None
        }
    };
}

find_extension!(find_supported_versions_ch, SupportedVersionsClientHello, SupportedVersionsClientHello);
find_extension!(find_supported_versions_sh, SupportedVersionsServerHello, SupportedVersionsServerHello);
find_extension!(find_key_share_ch, KeyShareClientHello, KeyShareClientHello);
find_extension!(find_key_share_sh, KeyShareServerHello, KeyShareServerHello);
find_extension!(find_key_share_retry, KeyShareHelloRetryRequest, KeyShareHelloRetryRequest);
find_extension!(find_signature_algorithms, SignatureAlgorithms, SignatureSchemeList);
find_extension!(find_supported_groups, SupportedGroups, NamedGroupList);
find_extension!(find_alpn, ALPN, ProtocolNameList);
find_extension!(find_cookie, Cookie, Cookie);
find_extension!(find_pre_shared_key_ch, PreSharedKeyClientHello, OfferedPsks);
find_extension!(find_psk_modes, PskKeyExchangeModes, PskKeyExchangeModeList);
find_extension!(find_srp_username, SrpUsername, Bytes);
find_extension!(find_session_ticket, SessionTicket, Bytes);
find_extension!(find_record_size_limit, RecordSizeLimit, u16);
find_extension!(find_heartbeat_mode, Heartbeat, HeartbeatMode);

pub fn find_server_name(extensions: &[Extension]) -> Option<&ServerNameList> {
    for e in extensions {
        if let Extension::ServerName(Some(v)) = e {
            return Some(v);
        }
    }

    None
}

pub fn find_pre_shared_key_sh(extensions: &[Extension]) -> Option<u16> {
    for e in extensions {
        if let Extension::PreSharedKeyServerHello(v) = e {
            return Some(*v);
        }
    }

    None
}

pub fn has_extension(extensions: &[Extension], typ: ExtensionType) -> bool {
    extensions.iter().any(|e| e.typ() == typ)
}

pub fn has_extended_master_secret(extensions: &[Extension]) -> bool {
    has_extension(extensions, ExtensionType::ExtendedMasterSecret)
}

pub fn has_encrypt_then_mac(extensions: &[Extension]) -> bool {
    has_extension(extensions, ExtensionType::EncryptThenMac)
}

pub fn has_post_handshake_auth(extensions: &[Extension]) -> bool {
    has_extension(extensions, ExtensionType::PostHandshakeAuth)
}

pub fn has_status_request(extensions: &[Extension]) -> bool {
    has_extension(extensions, ExtensionType::StatusRequest)
}
