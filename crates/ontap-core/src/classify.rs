// ── Error classification ──
//
// Static translation table from controller errors to the semantic
// classes the engine and handlers act on. Call sites ask
// `matches(err, class)` and never inspect codes or messages themselves.

use ontap_api::Error;
use strum::{AsRefStr, Display};

/// Semantic class of a controller or transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    /// A password change was rejected because it matches a previous one.
    PasswordReused,
    /// Create hit an object that already exists under that name.
    AlreadyExists,
    /// The addressed object does not exist.
    ObjectNotFound,
    /// The owning vserver does not exist.
    VserverMissing,
    /// A resize was rejected because the size is unchanged.
    SameSize,
    /// `502 Bad Gateway` from a long-running call.
    Transient502,
    /// Transport timeout (synthesized code `60`) from a long-running call.
    TransientTimeout60,
}

#[derive(Debug, Clone, Copy)]
enum Matcher {
    /// ZAPI `errno`.
    ZapiCode(&'static str),
    /// REST envelope `code`.
    RestCode(&'static str),
    /// HTTP status of a REST error.
    Status(u16),
    /// Case-insensitive substring of a REST or ZAPI message.
    Message(&'static str),
    /// Synthesized transport code.
    Transport(&'static str),
}

impl Matcher {
    fn hit(self, err: &Error) -> bool {
        match (self, err) {
            (Self::ZapiCode(code), Error::Zapi { code: c, .. }) => c == code,
            (Self::RestCode(code), Error::Rest { code: Some(c), .. }) => c == code,
            (Self::Status(status), Error::Rest { status: s, .. }) => *s == status,
            (Self::Message(needle), Error::Rest { message, .. } | Error::Zapi { message, .. }) => {
                message.to_ascii_lowercase().contains(needle)
            }
            (Self::Transport(code), Error::Transport(_)) => err.code() == Some(code),
            _ => false,
        }
    }
}

const TABLE: &[(ErrorClass, Matcher)] = &[
    (ErrorClass::PasswordReused, Matcher::ZapiCode("13214")),
    (ErrorClass::PasswordReused, Matcher::Message("new password must be different")),
    (ErrorClass::AlreadyExists, Matcher::ZapiCode("17")),
    (ErrorClass::AlreadyExists, Matcher::ZapiCode("13130")),
    (ErrorClass::AlreadyExists, Matcher::Message("already exists")),
    (ErrorClass::AlreadyExists, Matcher::Message("duplicate entry")),
    (ErrorClass::ObjectNotFound, Matcher::ZapiCode("15661")),
    (ErrorClass::ObjectNotFound, Matcher::RestCode("4")),
    (ErrorClass::ObjectNotFound, Matcher::Status(404)),
    (ErrorClass::VserverMissing, Matcher::ZapiCode("15698")),
    (ErrorClass::VserverMissing, Matcher::RestCode("2621462")),
    (ErrorClass::SameSize, Matcher::ZapiCode("9042")),
    (ErrorClass::SameSize, Matcher::Message("same as the current size")),
    (ErrorClass::SameSize, Matcher::Message("new size is the same")),
    (ErrorClass::Transient502, Matcher::Status(502)),
    (ErrorClass::TransientTimeout60, Matcher::Transport(ontap_api::error::TRANSPORT_TIMEOUT_CODE)),
];

/// Returns `true` if any table row maps `err` to `class`.
pub fn matches(err: &Error, class: ErrorClass) -> bool {
    TABLE
        .iter()
        .any(|(c, matcher)| *c == class && matcher.hit(err))
}

/// Every class `err` belongs to, in table order without duplicates.
pub fn classify(err: &Error) -> Vec<ErrorClass> {
    let mut out = Vec::new();
    for (class, matcher) in TABLE {
        if !out.contains(class) && matcher.hit(err) {
            out.push(*class);
        }
    }
    out
}

/// Vserver-missing requires the structured code AND the message naming
/// the vserver the caller supplied.
pub fn vserver_missing(err: &Error, vserver: &str) -> bool {
    !vserver.is_empty()
        && matches(err, ErrorClass::VserverMissing)
        && err.message().contains(vserver)
}

/// Already-exists counts only when the message names the object being
/// created; a conflict on some other object is a real failure.
pub fn already_exists(err: &Error, name: &str) -> bool {
    !name.is_empty() && matches(err, ErrorClass::AlreadyExists) && err.message().contains(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn zapi(code: &str, message: &str) -> Error {
        Error::Zapi {
            api: "x".into(),
            code: code.into(),
            message: message.into(),
        }
    }

    fn rest(status: u16, code: Option<&str>, message: &str) -> Error {
        Error::Rest {
            api: "x".into(),
            status,
            code: code.map(str::to_owned),
            message: message.into(),
            target: None,
        }
    }

    #[test]
    fn password_reuse_by_errno_and_message() {
        assert!(matches(
            &zapi("13214", "New password must be different than last 6 passwords."),
            ErrorClass::PasswordReused
        ));
        assert!(matches(
            &rest(400, Some("7077918"), "New password must be different than the old password."),
            ErrorClass::PasswordReused
        ));
        assert!(!matches(&zapi("13114", "whatever"), ErrorClass::PasswordReused));
    }

    #[test]
    fn not_found_by_code_and_status() {
        assert!(matches(&zapi("15661", "entry doesn't exist"), ErrorClass::ObjectNotFound));
        assert!(matches(&rest(404, None, "Not Found"), ErrorClass::ObjectNotFound));
        assert!(matches(&rest(400, Some("4"), "entry doesn't exist"), ErrorClass::ObjectNotFound));
    }

    #[test]
    fn vserver_missing_needs_code_and_name() {
        let err = zapi("15698", "Specified vserver not found: vs_gone");
        assert!(vserver_missing(&err, "vs_gone"));
        assert!(!vserver_missing(&err, "vs_other"));
        let substring_only = zapi("13001", "vserver vs_gone does not exist");
        assert!(!vserver_missing(&substring_only, "vs_gone"));
    }

    #[test]
    fn already_exists_needs_the_created_name() {
        let err = rest(409, Some("983089"), "Destination \"dest1\" already exists.");
        assert!(already_exists(&err, "dest1"));
        let other = rest(
            400,
            Some("983152"),
            "Filter \"important-events\" already exists in another destination",
        );
        assert!(matches(&other, ErrorClass::AlreadyExists));
        assert!(!already_exists(&other, "dest1"));
        assert!(!already_exists(&zapi("17", "duplicate entry"), "vol1"));
    }

    #[test]
    fn transient_502() {
        assert_eq!(classify(&rest(502, None, "Bad Gateway")), vec![ErrorClass::Transient502]);
    }

    #[test]
    fn unrelated_errors_have_no_class() {
        assert!(classify(&rest(400, Some("917927"), "invalid aggregate")).is_empty());
    }
}
