use std::fmt;

/// Result codes returned by the server in the message header. Codes the
/// command core never branches on are preserved through `Unknown`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ResultCode {
    Ok,
    ServerError,
    KeyNotFoundError,
    GenerationError,
    ParameterError,
    KeyExistsError,
    BinExistsError,
    Timeout,
    ServerNotAvailable,
    DeviceOverload,
    BinNotFound,
    FilteredOut,
    QueryEnd,
    SecurityNotEnabled,
    InvalidUser,
    UserExists,
    InvalidPassword,
    ExpiredPassword,
    ForbiddenPassword,
    InvalidCredential,
    InvalidRole,
    RoleExists,
    UdfBadResponse,
    MrtBlocked,
    MrtVersionMismatch,
    MrtExpired,
    MrtCommitted,
    MrtAborted,
    Unknown(u8),
}

impl From<u8> for ResultCode {
    fn from(code: u8) -> ResultCode {
        match code {
            0 => ResultCode::Ok,
            1 => ResultCode::ServerError,
            2 => ResultCode::KeyNotFoundError,
            3 => ResultCode::GenerationError,
            4 => ResultCode::ParameterError,
            5 => ResultCode::KeyExistsError,
            6 => ResultCode::BinExistsError,
            9 => ResultCode::Timeout,
            11 => ResultCode::ServerNotAvailable,
            18 => ResultCode::DeviceOverload,
            17 => ResultCode::BinNotFound,
            27 => ResultCode::FilteredOut,
            50 => ResultCode::QueryEnd,
            52 => ResultCode::SecurityNotEnabled,
            60 => ResultCode::InvalidUser,
            61 => ResultCode::UserExists,
            62 => ResultCode::InvalidPassword,
            63 => ResultCode::ExpiredPassword,
            64 => ResultCode::ForbiddenPassword,
            65 => ResultCode::InvalidCredential,
            70 => ResultCode::InvalidRole,
            71 => ResultCode::RoleExists,
            100 => ResultCode::UdfBadResponse,
            120 => ResultCode::MrtBlocked,
            121 => ResultCode::MrtCommitted,
            122 => ResultCode::MrtAborted,
            124 => ResultCode::MrtVersionMismatch,
            125 => ResultCode::MrtExpired,
            code => ResultCode::Unknown(code),
        }
    }
}

impl From<ResultCode> for u8 {
    fn from(code: ResultCode) -> u8 {
        match code {
            ResultCode::Ok => 0,
            ResultCode::ServerError => 1,
            ResultCode::KeyNotFoundError => 2,
            ResultCode::GenerationError => 3,
            ResultCode::ParameterError => 4,
            ResultCode::KeyExistsError => 5,
            ResultCode::BinExistsError => 6,
            ResultCode::Timeout => 9,
            ResultCode::ServerNotAvailable => 11,
            ResultCode::BinNotFound => 17,
            ResultCode::DeviceOverload => 18,
            ResultCode::FilteredOut => 27,
            ResultCode::QueryEnd => 50,
            ResultCode::SecurityNotEnabled => 52,
            ResultCode::InvalidUser => 60,
            ResultCode::UserExists => 61,
            ResultCode::InvalidPassword => 62,
            ResultCode::ExpiredPassword => 63,
            ResultCode::ForbiddenPassword => 64,
            ResultCode::InvalidCredential => 65,
            ResultCode::InvalidRole => 70,
            ResultCode::RoleExists => 71,
            ResultCode::UdfBadResponse => 100,
            ResultCode::MrtBlocked => 120,
            ResultCode::MrtCommitted => 121,
            ResultCode::MrtAborted => 122,
            ResultCode::MrtVersionMismatch => 124,
            ResultCode::MrtExpired => 125,
            ResultCode::Unknown(code) => code,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResultCode::Unknown(code) => write!(f, "unknown result code {}", code),
            code => write!(f, "{:?}({})", code, u8::from(*code)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_known_codes() {
        for raw in [0u8, 2, 3, 4, 5, 6, 9, 18, 27, 50, 100, 121, 122].iter() {
            let code = ResultCode::from(*raw);
            assert!(!matches!(code, ResultCode::Unknown(_)));
            assert_eq!(u8::from(code), *raw);
        }
    }

    #[test]
    fn test_unknown_code_preserved() {
        let code = ResultCode::from(213);
        assert_eq!(code, ResultCode::Unknown(213));
        assert_eq!(u8::from(code), 213);
    }
}
