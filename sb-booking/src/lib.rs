//! Booking boundary for salonbot.
//!
//! Commands extracted from model replies are validated, resolved against the
//! tenant catalog and executed here against a [`BookingBackend`], with
//! per-call timeouts, bounded retries and booking idempotency.

mod backend;
mod catalog;
mod command;
mod error;
mod executor;
mod handlers;
mod http_backend;
mod memory_backend;
mod model;
mod params;
mod resolve;

pub use backend::BookingBackend;
pub use catalog::{Catalog, CatalogCache};
pub use command::{
    Clarification, Command, CommandError, CommandName, CommandResult, CommandStatus,
};
pub use error::{BookingError, ErrorKind, Result};
pub use executor::{CommandExecutor, ExecutorConfig, TurnExecution, TurnLedger};
pub use handlers::{CommandHandler, CommandOutcome, Resolution, Resolved, default_handlers};
pub use http_backend::HttpBookingBackend;
pub use memory_backend::{InMemoryBookingBackend, TenantCatalog};
pub use model::{
    AvailabilityQuery, Booking, BookingFingerprint, BookingRecord, BookingRequest, BookingStatus,
    ConversationContext, PortfolioItem, PriceRange, Service, Slot, StaffMember,
};
pub use params::{ArgValue, HandlerSpec, ParamKind, ParamSpec, StaffRef, ValidatedArgs};
