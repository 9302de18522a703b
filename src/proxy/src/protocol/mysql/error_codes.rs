/// Server-side MySQL error codes the gateway itself emits. A transparent proxy forwards
/// the database's own error frames untouched; these are only used for failures the
/// gateway raises on the database's behalf (censor denial, handshake timeout).
///
/// Codes and SQLSTATE mappings follow the public MySQL error reference:
/// https://dev.mysql.com/doc/mysql-errors/8.0/en/server-error-reference.html
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorKind {
    ErAccessDeniedError = 1045,
    ErDbAccessDenied = 1044,
    ErQueryInterrupted = 1317,
    ErNotSupportedYet = 1235,
    ErUnknownError = 1105,
}

impl ErrorKind {
    pub fn sqlstate(self) -> &'static [u8] {
        match self {
            ErrorKind::ErAccessDeniedError => b"28000",
            ErrorKind::ErDbAccessDenied => b"42000",
            ErrorKind::ErQueryInterrupted => b"70100",
            ErrorKind::ErNotSupportedYet => b"42000",
            ErrorKind::ErUnknownError => b"HY000",
        }
    }

    /// The error raised when the censor denies a query: MySQL has no dedicated "statement
    /// forbidden" code, so `ER_DBACCESS_DENIED_ERROR` (1044, SQLSTATE 42000) is the closest
    /// server-authored analogue and is what real MySQL firewalls surface for this case.
    pub fn censor_denied() -> Self {
        ErrorKind::ErDbAccessDenied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn censor_denied_maps_to_42000() {
        assert_eq!(ErrorKind::censor_denied().sqlstate(), b"42000");
    }
}
