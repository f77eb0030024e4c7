//! Service layer
//!
//! Services are the executor's collaborators. Each concern is a trait so the
//! executor can be driven by real processes and HTTP sinks in production and
//! by in-memory fakes in tests:
//! - credentials: `CredentialStore` behind a scoped `CredentialBroker`
//! - approval: `ApprovalService` behind a bounded `ApprovalGate`
//! - status: `StatusSink` behind a retrying `StatusReporter`
//! - notify: `Notifier` plus the recipient policy

mod approval;
mod credentials;
mod notify;
mod status;

// Re-export traits
pub use approval::ApprovalService;
pub use credentials::CredentialStore;
pub use notify::Notifier;
pub use status::StatusSink;

// Re-export implementations
pub use approval::{
    ApprovalDecision, ApprovalGate, ApprovalOutcome, ApprovalRequest, FileApprovalService,
};
pub use credentials::{
    CredentialBroker, EnvCredentialStore, InMemoryCredentialStore, Masker, ScopedCredential,
};
pub use notify::{LogNotifier, MailNotifier, Notification, RecipientPolicy};
pub use status::{CommitStatusSink, FanOutSink, LogStatusSink, StatusReporter};
