use std::borrow::Cow;

use tracing::Level;

/// ErrorMetadata object can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It is a generic object to be used
/// across the pagination core to tag errors with information that is used to
/// classify them.
///
/// The msg is conveyed as a user facing error message if it makes it to the
/// caller.
///
/// The short_msg is used as a tag - available for tests and for log fields -
/// to have a message that is resilient to changes in copy.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata
    pub code: ErrorCode,
    /// short ScreamingCamelCase. Usable in tests for string matching
    /// w/ a standard test helper.
    /// Eg InvalidPageNumber
    pub short_msg: Cow<'static, str>,
    /// human readable - developer facing. Should be longer and descriptive.
    /// Eg "Page numbers start at 1, but page 0 was requested"
    pub msg: Cow<'static, str>,
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    PaginationLimit,

    Overloaded,
}

impl ErrorMetadata {
    /// Bad Request. The caller passed something the pagination core can
    /// never accept (page 0, an empty field path, ...).
    ///
    /// The short_msg should be a CapitalCamelCased describing the error.
    /// The msg should be a descriptive message targeted toward the developer.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The document store refused or dropped a read. Retrying later is
    /// expected to succeed.
    ///
    /// If you do not need a custom error message, do not use this method.
    /// Instead use anyhow without any ErrorMetadata, which will automatically
    /// be shown to the user as a generic internal server error.
    pub fn overloaded(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Overloaded,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Hit some kind of external facing pagination limit (eg a page size or
    /// target page beyond the configured maximum).
    ///
    /// The short_msg should be a CapitalCamelCased describing the error (eg
    /// PageSizeTooLarge).
    /// The msg should be a descriptive message targeted toward the developer.
    pub fn pagination_limit(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::PaginationLimit,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn is_pagination_limit(&self) -> bool {
        self.code == ErrorCode::PaginationLimit
    }

    pub fn is_bad_request(&self) -> bool {
        self.code == ErrorCode::BadRequest
    }

    pub fn is_overloaded(&self) -> bool {
        self.code == ErrorCode::Overloaded
    }

    /// Return true if this error is deterministically caused by the caller.
    /// Retrying the same request will fail the same way.
    pub fn is_deterministic_user_error(&self) -> bool {
        match self.code {
            ErrorCode::BadRequest | ErrorCode::PaginationLimit => true,
            ErrorCode::Overloaded => false,
        }
    }

    /// The level at which this error should be logged.
    /// INFO -> it's a caller-at-fault error
    /// WARN -> it's a store-at-fault error that is expected
    pub fn log_level(&self) -> Level {
        match self.code {
            ErrorCode::BadRequest | ErrorCode::PaginationLimit => Level::INFO,
            ErrorCode::Overloaded => Level::WARN,
        }
    }
}

pub trait ErrorMetadataAnyhowExt {
    fn is_pagination_limit(&self) -> bool;
    fn is_bad_request(&self) -> bool;
    fn is_overloaded(&self) -> bool;
    fn is_deterministic_user_error(&self) -> bool;
    fn log_level(&self) -> Level;
    fn user_facing_message(&self) -> String;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
    fn wrap_error_message<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> String;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    /// Returns true if error is tagged as PaginationLimit
    fn is_pagination_limit(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_pagination_limit();
        }
        false
    }

    /// Returns true if error is tagged as BadRequest
    fn is_bad_request(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_bad_request();
        }
        false
    }

    /// Returns true if error is tagged as Overloaded
    fn is_overloaded(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_overloaded();
        }
        false
    }

    /// Return true if this error is deterministically caused by the caller.
    /// Callers use this to decide whether offering a retry makes sense.
    fn is_deterministic_user_error(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_deterministic_user_error();
        }
        false
    }

    /// Untagged errors are unexpected, so they log at ERROR.
    fn log_level(&self) -> Level {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.log_level();
        }
        Level::ERROR
    }

    fn user_facing_message(&self) -> String {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.to_string();
        }
        INTERNAL_SERVER_ERROR_MSG.to_string()
    }

    /// Return the short_msg associated with this Error
    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        INTERNAL_SERVER_ERROR
    }

    /// Return the descriptive msg associated with this Error
    fn msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.msg;
        }
        INTERNAL_SERVER_ERROR_MSG
    }

    /// Wrap the underlying error message, maintaining the underlying error
    /// metadata short code if it exists.
    fn wrap_error_message<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> String,
    {
        if let Some(mut em) = self.downcast_ref::<ErrorMetadata>().cloned() {
            // Underlying ErrorMetadata. Reuse and reattach it.
            em.msg = f(em.msg.to_string()).into();
            return self.context(em);
        }

        // No underlying code. Just use .context()
        let new_msg = f(self.to_string());
        self.context(new_msg)
    }
}

pub const INTERNAL_SERVER_ERROR_MSG: &str = "Your request couldn't be completed. Try again later.";
pub const INTERNAL_SERVER_ERROR: &str = "InternalServerError";

#[cfg(any(test, feature = "testing"))]
mod proptest_impls {
    use proptest::prelude::*;

    use super::{
        ErrorCode,
        ErrorMetadata,
    };

    impl Arbitrary for ErrorMetadata {
        type Parameters = ();

        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            any::<ErrorCode>()
                .prop_map(|ec| match ec {
                    ErrorCode::BadRequest => ErrorMetadata::bad_request("bad", "request"),
                    ErrorCode::PaginationLimit => {
                        ErrorMetadata::pagination_limit("pagination", "limit")
                    },
                    ErrorCode::Overloaded => ErrorMetadata::overloaded("overloaded", "error"),
                })
                .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tracing::Level;

    use crate::{
        ErrorCode,
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
        INTERNAL_SERVER_ERROR,
        INTERNAL_SERVER_ERROR_MSG,
    };

    proptest! {
        #![proptest_config(
            ProptestConfig { failure_persistence: None, ..ProptestConfig::default() }
        )]

        #[test]
        fn test_error_classification(err in any::<ErrorMetadata>()) {
            assert_ne!(err.short_msg, INTERNAL_SERVER_ERROR);
            if err.is_deterministic_user_error() {
                // Caller is responsible for error.
                assert_eq!(err.log_level(), Level::INFO);
            } else {
                assert_eq!(err.code, ErrorCode::Overloaded);
                assert_eq!(err.log_level(), Level::WARN);
            }
        }

        #[test]
        fn test_metadata_survives_context(err in any::<ErrorMetadata>()) {
            let wrapped = anyhow::anyhow!("store said no")
                .context(err.clone())
                .context("while reading page 3");
            assert_eq!(wrapped.short_msg(), &*err.short_msg);
            assert_eq!(wrapped.is_deterministic_user_error(), err.is_deterministic_user_error());
        }
    }

    #[test]
    fn test_untagged_errors_are_internal() {
        let err = anyhow::anyhow!("socket closed");
        assert_eq!(err.short_msg(), INTERNAL_SERVER_ERROR);
        assert_eq!(err.user_facing_message(), INTERNAL_SERVER_ERROR_MSG);
        assert_eq!(err.log_level(), Level::ERROR);
        assert!(!err.is_deterministic_user_error());
    }

    #[test]
    fn test_wrap_error_message_keeps_short_msg() {
        let err = anyhow::anyhow!(ErrorMetadata::bad_request(
            "InvalidPageNumber",
            "Page numbers start at 1"
        ))
        .wrap_error_message(|msg| format!("loadPage failed: {msg}"));
        assert!(err.is_bad_request());
        assert_eq!(err.short_msg(), "InvalidPageNumber");
        assert_eq!(err.msg(), "loadPage failed: Page numbers start at 1");
    }
}
