// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! Crate-wide error glue.
//!
//! Individual subsystems define their own `thiserror::Error` enums (see
//! `content::Error`, `fileindex::Error`, `largereply::Error`, `config::
//! Error`, `wire::Error`) and never throw across component boundaries (§7);
//! this top-level [`Error`] only exists for the dispatch layer, which is the
//! single place that needs to fold all of them into one client-facing
//! status.

use thiserror::Error;

use crate::{bloom, config, content, fileindex, largereply, wire};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),

    #[error(transparent)]
    Content(#[from] content::Error),

    #[error(transparent)]
    FileIndex(#[from] fileindex::Error),

    #[error(transparent)]
    LargeReply(#[from] largereply::Error),

    #[error(transparent)]
    Bloom(#[from] bloom::Error),

    #[error(transparent)]
    Wire(#[from] wire::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The two-valued status a local client ultimately sees (§7 Local-client).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Ok,
    SysErr,
}

impl From<&Error> for Status {
    fn from(_: &Error) -> Self {
        // Every internal error is logged with full detail by its origin;
        // clients only ever learn that something failed.
        Status::SysErr
    }
}
