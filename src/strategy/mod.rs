// The three compound-order managers
pub mod grid;
pub mod oco;
pub mod twap;

pub use grid::{GridManager, GridParams};
pub use oco::{OcoManager, OcoParams};
pub use twap::{TwapManager, TwapParams};

use crate::error::ExchangeError;

/// A cancel that races a fill or a prior cancel is success, not an error:
/// the order is terminal either way and a status refresh settles which.
pub(crate) fn cancel_resolved(result: Result<(), ExchangeError>) -> Result<(), ExchangeError> {
    match result {
        Ok(()) => Ok(()),
        Err(ExchangeError::OrderNotFound(_)) | Err(ExchangeError::AlreadyTerminal(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_resolved_is_idempotent() {
        assert!(cancel_resolved(Ok(())).is_ok());
        assert!(cancel_resolved(Err(ExchangeError::OrderNotFound(1))).is_ok());
        assert!(cancel_resolved(Err(ExchangeError::AlreadyTerminal(1))).is_ok());
        assert!(cancel_resolved(Err(ExchangeError::Timeout)).is_err());
    }
}
