// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Result code translation
//!
//! A handler answers with a raw integer whose meaning depends on the
//! convention bound to the mount: posix (`0` allows, a negative errno
//! denies) or the provider API enumeration (`PrjFS_Result_*`). Both map
//! onto the single [`Decision`] type through fixed tables, so the engine
//! behaves identically whichever convention a provider speaks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum::{EnumIter, IntoEnumIterator, IntoStaticStr};

use crate::error::TranslateError;

/// Prefix carried by fully-qualified provider API result names
pub const PROVIDER_RESULT_PREFIX: &str = "PrjFS_Result_";

/// Posix-side null marker. Positive values are never errnos, so this can
/// not collide with a real decision code.
pub const POSIX_NULL_MARKER: i32 = 1;

/// Result code convention fixed per mount
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Convention {
    #[default]
    Posix,
    ProviderApi,
}

impl fmt::Display for Convention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Convention::Posix => f.write_str("posix"),
            Convention::ProviderApi => f.write_str("provider_api"),
        }
    }
}

impl FromStr for Convention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "posix" | "errno" => Ok(Convention::Posix),
            "provider_api" | "provider-api" | "vfsapi" => Ok(Convention::ProviderApi),
            _ => Err(format!(
                "Invalid convention: {}. Use 'posix' or 'provider_api'",
                s
            )),
        }
    }
}

/// Why an operation was denied
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DenyReason {
    PermissionDenied,
    InvalidOperation,
    NotFound,
    PathNotFound,
    IoError,
    NotSupported,
    OutOfMemory,
    InvalidArgument,
    InvalidHandle,
    NotYetImplemented,
    DriverNotLoaded,
}

impl DenyReason {
    /// Positive errno for this reason
    pub const fn errno(self) -> i32 {
        match self {
            DenyReason::PermissionDenied => libc::EPERM,
            DenyReason::InvalidOperation => libc::EACCES,
            DenyReason::NotFound => libc::ENOENT,
            DenyReason::PathNotFound => libc::ENOTDIR,
            DenyReason::IoError => libc::EIO,
            DenyReason::NotSupported => libc::ENOTSUP,
            DenyReason::OutOfMemory => libc::ENOMEM,
            DenyReason::InvalidArgument => libc::EINVAL,
            DenyReason::InvalidHandle => libc::EBADF,
            DenyReason::NotYetImplemented => libc::ENOSYS,
            DenyReason::DriverNotLoaded => libc::ENODEV,
        }
    }

    pub const fn errno_name(self) -> &'static str {
        match self {
            DenyReason::PermissionDenied => "EPERM",
            DenyReason::InvalidOperation => "EACCES",
            DenyReason::NotFound => "ENOENT",
            DenyReason::PathNotFound => "ENOTDIR",
            DenyReason::IoError => "EIO",
            DenyReason::NotSupported => "ENOTSUP",
            DenyReason::OutOfMemory => "ENOMEM",
            DenyReason::InvalidArgument => "EINVAL",
            DenyReason::InvalidHandle => "EBADF",
            DenyReason::NotYetImplemented => "ENOSYS",
            DenyReason::DriverNotLoaded => "ENODEV",
        }
    }

    pub const fn provider_result(self) -> ProviderResult {
        match self {
            DenyReason::PermissionDenied => ProviderResult::EAccessDenied,
            DenyReason::InvalidOperation => ProviderResult::EInvalidOperation,
            DenyReason::NotFound => ProviderResult::EFileNotFound,
            DenyReason::PathNotFound => ProviderResult::EPathNotFound,
            DenyReason::IoError => ProviderResult::EIOError,
            DenyReason::NotSupported => ProviderResult::ENotSupported,
            DenyReason::OutOfMemory => ProviderResult::EOutOfMemory,
            DenyReason::InvalidArgument => ProviderResult::EInvalidArgs,
            DenyReason::InvalidHandle => ProviderResult::EInvalidHandle,
            DenyReason::NotYetImplemented => ProviderResult::ENotYetImplemented,
            DenyReason::DriverNotLoaded => ProviderResult::EDriverNotLoaded,
        }
    }

    pub fn from_errno(errno: i32) -> Option<Self> {
        Self::iter().find(|reason| reason.errno() == errno)
    }

    pub fn from_provider_result(result: ProviderResult) -> Option<Self> {
        Self::iter().find(|reason| reason.provider_result() == result)
    }

    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider API result enumeration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter)]
#[repr(u32)]
pub enum ProviderResult {
    Invalid = 0x0000_0000,
    Success = 0x0000_0001,
    Pending = 0x0000_0002,
    EInvalidArgs = 0x1000_0001,
    EInvalidOperation = 0x1000_0002,
    ENotSupported = 0x1000_0004,
    EDriverNotLoaded = 0x2000_0001,
    EOutOfMemory = 0x2000_0002,
    EFileNotFound = 0x2000_0004,
    EPathNotFound = 0x2000_0008,
    EAccessDenied = 0x2000_0010,
    EInvalidHandle = 0x2000_0020,
    EIOError = 0x2000_0040,
    ENotYetImplemented = 0xFFFF_FFFF,
}

impl ProviderResult {
    /// Raw code as handed across the handler boundary
    pub const fn code(self) -> i32 {
        self as u32 as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::iter().find(|result| result.code() == code)
    }

    /// Name without the `PrjFS_Result_` prefix
    pub const fn short_name(self) -> &'static str {
        match self {
            ProviderResult::Invalid => "Invalid",
            ProviderResult::Success => "Success",
            ProviderResult::Pending => "Pending",
            ProviderResult::EInvalidArgs => "EInvalidArgs",
            ProviderResult::EInvalidOperation => "EInvalidOperation",
            ProviderResult::ENotSupported => "ENotSupported",
            ProviderResult::EDriverNotLoaded => "EDriverNotLoaded",
            ProviderResult::EOutOfMemory => "EOutOfMemory",
            ProviderResult::EFileNotFound => "EFileNotFound",
            ProviderResult::EPathNotFound => "EPathNotFound",
            ProviderResult::EAccessDenied => "EAccessDenied",
            ProviderResult::EInvalidHandle => "EInvalidHandle",
            ProviderResult::EIOError => "EIOError",
            ProviderResult::ENotYetImplemented => "ENotYetImplemented",
        }
    }

    pub fn name(self) -> String {
        format!("{}{}", PROVIDER_RESULT_PREFIX, self.short_name())
    }
}

/// Symbolic outcome of a dispatched operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny(DenyReason),
    /// Deferred to a later out-of-band completion (pooled mode only)
    Pending,
}

impl Decision {
    /// Generic denial used for the `deny` symbol
    pub const DENY: Decision = Decision::Deny(DenyReason::PermissionDenied);

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// Errno to reply to the transport with; `None` while pending.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Decision::Allow => Some(0),
            Decision::Deny(reason) => Some(reason.errno()),
            Decision::Pending => None,
        }
    }

    /// Every decision, in table order
    pub fn all() -> impl Iterator<Item = Decision> {
        [Decision::Allow, Decision::Pending]
            .into_iter()
            .chain(DenyReason::iter().map(Decision::Deny))
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow => f.write_str("allow"),
            Decision::Deny(reason) => write!(f, "deny({})", reason),
            Decision::Pending => f.write_str("pending"),
        }
    }
}

/// Encode a decision in the given convention
pub fn to_code(decision: Decision, convention: Convention) -> Result<i32, TranslateError> {
    match (convention, decision) {
        (Convention::Posix, Decision::Allow) => Ok(0),
        (Convention::Posix, Decision::Deny(reason)) => Ok(-reason.errno()),
        (Convention::Posix, Decision::Pending) => Err(TranslateError::UnsupportedConvention {
            decision: decision.to_string(),
            convention,
        }),
        (Convention::ProviderApi, Decision::Allow) => Ok(ProviderResult::Success.code()),
        (Convention::ProviderApi, Decision::Pending) => Ok(ProviderResult::Pending.code()),
        (Convention::ProviderApi, Decision::Deny(reason)) => Ok(reason.provider_result().code()),
    }
}

/// Decode a raw handler result in the given convention
pub fn from_code(code: i32, convention: Convention) -> Result<Decision, TranslateError> {
    let unknown = TranslateError::UnknownCode { code, convention };
    match convention {
        Convention::Posix => match code {
            0 => Ok(Decision::Allow),
            POSIX_NULL_MARKER => Err(TranslateError::NullMarker { convention }),
            c if c < 0 => c
                .checked_neg()
                .and_then(DenyReason::from_errno)
                .map(Decision::Deny)
                .ok_or(unknown),
            _ => Err(unknown),
        },
        Convention::ProviderApi => match ProviderResult::from_code(code) {
            Some(ProviderResult::Success) => Ok(Decision::Allow),
            Some(ProviderResult::Pending) => Ok(Decision::Pending),
            Some(ProviderResult::Invalid) => Err(TranslateError::NullMarker { convention }),
            Some(result) => DenyReason::from_provider_result(result)
                .map(Decision::Deny)
                .ok_or(unknown),
            None => Err(unknown),
        },
    }
}

/// Code of the test-fixture-only `null` marker
pub fn null_marker(convention: Convention) -> i32 {
    match convention {
        Convention::Posix => POSIX_NULL_MARKER,
        Convention::ProviderApi => ProviderResult::Invalid.code(),
    }
}

/// Resolve a configuration-boundary symbol to a raw code.
///
/// Accepts `allow`, `deny`, `null`, errno names (posix) or provider
/// result names with or without the `PrjFS_Result_` prefix; matching is
/// case-insensitive.
pub fn parse_symbol(symbol: &str, convention: Convention) -> Result<i32, TranslateError> {
    if symbol.eq_ignore_ascii_case("allow") {
        return to_code(Decision::Allow, convention);
    }
    if symbol.eq_ignore_ascii_case("deny") {
        return to_code(Decision::DENY, convention);
    }
    if symbol.eq_ignore_ascii_case("null") {
        return Ok(null_marker(convention));
    }

    let found = match convention {
        Convention::Posix => DenyReason::iter()
            .find(|reason| reason.errno_name().eq_ignore_ascii_case(symbol))
            .map(|reason| -reason.errno()),
        Convention::ProviderApi => ProviderResult::iter()
            .find(|result| {
                result.name().eq_ignore_ascii_case(symbol)
                    || result.short_name().eq_ignore_ascii_case(symbol)
            })
            .map(ProviderResult::code),
    };
    found.ok_or_else(|| TranslateError::UnknownSymbol(symbol.to_string()))
}

/// Every symbol accepted by [`parse_symbol`] for a convention
pub fn symbol_names(convention: Convention) -> Vec<String> {
    let mut names = vec!["allow".to_string(), "deny".to_string(), "null".to_string()];
    match convention {
        Convention::Posix => {
            names.extend(DenyReason::iter().map(|reason| reason.errno_name().to_string()))
        }
        Convention::ProviderApi => names.extend(ProviderResult::iter().map(ProviderResult::name)),
    }
    names
}
