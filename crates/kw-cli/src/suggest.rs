//! What to tell the user after a command fails.

use kw_core::{ErrorKind, KwError};

/// A remedy for `err`, or `None` when the message speaks for itself.
pub fn suggestion(err: &KwError) -> Option<String> {
    let text = match err {
        KwError::NotSetup { filesystem } => {
            format!("Run \"keywarden setup --filesystem {filesystem}\" to use keywarden on this filesystem.")
        }
        KwError::MissingPolicyMetadata { .. } => "This directory was encrypted by another tool, \
             or its metadata store was removed or wiped."
            .into(),
        KwError::PolicyMetadataMismatch { .. } => "The policy references protectors that no \
             configured store holds. You may need to configure the filesystem they live on, \
             or remove them with \"keywarden policy remove\"."
            .into(),
        KwError::MissingProtectorName { .. } => "Use --name to specify a protector name.".into(),
        KwError::Destructive { .. } | KwError::WouldOrphanPolicy { .. } | KwError::StillInUse { .. } => {
            "Use --force to run destructive operations anyway.".into()
        }
        KwError::SpecifyProtector { candidates, .. } => {
            let list = candidates
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            format!("Use --protector to pick one of: {list}")
        }
        KwError::SpecifyKeyfile => "Use --keyfile to specify a key file.".into(),
        KwError::BadOwner { .. } => "Encryption can only be set up on directories you own, \
             unless you are root."
            .into(),
        KwError::NotEmptyDir { .. } => "Encryption can only be set up on empty directories. \
             Move the files out, encrypt the directory, then move them back in, or use --force."
            .into(),
        KwError::AllLoadsFailed { .. } => "You may need to configure a linked filesystem. \
             Run with --log debug for more information."
            .into(),
        KwError::MustBeRoot => "Re-run the command with sudo.".into(),
        KwError::Busy { .. } => "Another keywarden process holds the store lock. Try again, \
             or set store.lock_mode = \"blocking\" to wait for it."
            .into(),
        KwError::PolicyUnlocked { .. } => "Run \"keywarden lock\" first to re-unlock.".into(),
        _ if err.kind() == ErrorKind::Config => {
            "Check the config file, or run \"sudo keywarden setup\" to recreate it.".into()
        }
        _ => return None,
    };
    Some(text)
}
