// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fixed-result provider used by `projfs-mount` and the scenario tests

use projfs_core::result_code::parse_symbol;
use projfs_core::{
    Convention, Event, EventHandler, HandlerContext, HandlerRegistry, OperationKind, TranslateError,
};
use std::sync::Arc;
use strum::IntoEnumIterator;
use tracing::info;

/// Answers every event with the same raw code and logs what it saw
#[derive(Clone, Debug)]
pub struct FixedResult {
    code: i32,
}

impl FixedResult {
    pub fn new(code: i32) -> Self {
        Self { code }
    }

    /// Resolve a `--retval` style symbol in the given convention
    pub fn from_symbol(symbol: &str, convention: Convention) -> Result<Self, TranslateError> {
        Ok(Self::new(parse_symbol(symbol, convention)?))
    }

    pub fn code(&self) -> i32 {
        self.code
    }
}

impl EventHandler for FixedResult {
    fn handle(&self, event: &Event, _context: &HandlerContext) -> i32 {
        info!(
            kind = %event.kind,
            path = %event.path.display(),
            target = ?event.target,
            pid = event.pid,
            code = self.code,
            "provider event"
        );
        self.code
    }
}

/// Registry with `handler` bound to every operation kind
pub fn registry_for(handler: Arc<dyn EventHandler>) -> HandlerRegistry {
    let registry = HandlerRegistry::new();
    for kind in OperationKind::iter() {
        // a fresh registry is never sealed
        let _ = registry.register(kind, Arc::clone(&handler), HandlerContext::empty());
    }
    registry
}

/// Registry answering every event with `symbol`
pub fn fixed_result_registry(
    symbol: &str,
    convention: Convention,
) -> Result<HandlerRegistry, TranslateError> {
    let handler = FixedResult::from_symbol(symbol, convention)?;
    Ok(registry_for(Arc::new(handler)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use projfs_core::result_code::ProviderResult;

    #[test]
    fn symbols_resolve_per_convention() {
        assert_eq!(FixedResult::from_symbol("allow", Convention::Posix).unwrap().code(), 0);
        assert_eq!(
            FixedResult::from_symbol("deny", Convention::Posix).unwrap().code(),
            -libc::EPERM
        );
        assert_eq!(
            FixedResult::from_symbol("PrjFS_Result_EAccessDenied", Convention::ProviderApi)
                .unwrap()
                .code(),
            ProviderResult::EAccessDenied.code()
        );
        assert!(matches!(
            FixedResult::from_symbol("maybe", Convention::Posix),
            Err(TranslateError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn every_kind_is_bound() {
        let registry = fixed_result_registry("eio", Convention::Posix).unwrap();
        registry.seal();
        for kind in OperationKind::iter() {
            assert!(registry.lookup(kind).is_some(), "{kind}");
        }
    }
}
