//! Checkout orchestration and payment settlement.
//!
//! The checkout flow follows these steps:
//! 1. Validate the cart (not expired, active, non-empty)
//! 2. Extend the cart's expiry to cover the hold
//! 3. Pre-check availability and report every shortfall
//! 4. Reserve every line item, or nothing
//! 5. Create a remote payment session
//! 6. Mark the cart ordered and open a pending order
//!
//! If step 5 or 6 fails, or the future is dropped in between, the reservation
//! is released before the error leaves this crate. Settlement later turns the
//! reservation into a sale or reverses it.

pub mod cipher;
pub mod context;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod payment;
pub mod settlement;
pub mod signature;
pub mod sweeper;

pub use cipher::{CipherError, PiiCipher, PlaintextCipher};
pub use context::RequestContext;
pub use error::{CheckoutError, ErrorKind, Result};
pub use events::{
    CHECKOUT_COMPLETED, CHECKOUT_EXPIRED, NotificationKind, ProviderEvent, SessionPayload,
};
pub use orchestrator::{CheckoutOrchestrator, CheckoutPolicy, CheckoutRequest, CheckoutStarted};
pub use payment::{
    CheckoutSessionRequest, GatewayError, HttpPaymentGateway, InMemoryPaymentGateway, LineItem,
    PaymentGateway, RemoteSession,
};
pub use settlement::{SettlementHandler, SettlementOutcome};
pub use signature::{SIGNATURE_HEADER, WebhookVerifier};
pub use sweeper::{ReservationSweeper, SweepReport};
