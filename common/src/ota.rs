use std::fmt::Write as _;

use log::{info, warn};
use sha2::{Digest, Sha256};

use crate::error::OtaError;

/// Streaming flash-update target of unknown total size.
pub trait FlashUpdate: Send {
    fn begin(&mut self) -> Result<(), OtaError>;

    /// Returns the number of bytes actually committed.
    fn write(&mut self, chunk: &[u8]) -> usize;

    /// Validates the assembled image and marks it bootable.
    fn end(&mut self) -> Result<(), OtaError>;

    /// Discards a partially written image. Must be safe to call when nothing
    /// was opened.
    fn abort(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaStatus {
    Idle,
    Receiving,
    Finalizing,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaOutcome {
    Complete { bytes_written: usize, sha256: String },
    Failed(OtaError),
}

pub struct OtaSession<F: FlashUpdate> {
    target: F,
    status: OtaStatus,
    bytes_written: usize,
    hasher: Sha256,
    failure: Option<OtaError>,
}

impl<F: FlashUpdate> OtaSession<F> {
    pub fn new(target: F) -> Self {
        Self {
            target,
            status: OtaStatus::Idle,
            bytes_written: 0,
            hasher: Sha256::new(),
            failure: None,
        }
    }

    pub fn status(&self) -> OtaStatus {
        self.status
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    pub fn failure(&self) -> Option<&OtaError> {
        self.failure.as_ref()
    }

    pub fn target(&self) -> &F {
        &self.target
    }

    /// Opens the flash target. Called implicitly by the first non-empty
    /// chunk; a failed open leaves the session draining until `finish`.
    pub fn begin(&mut self) {
        self.reset();
        info!("ota: upload started");
        match self.target.begin() {
            Ok(()) => self.status = OtaStatus::Receiving,
            Err(err) => self.fail(err, false),
        }
    }

    /// Feeds one chunk. Once failed, chunks are consumed without being
    /// written so the request body can still be drained.
    pub fn write(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        if self.status == OtaStatus::Idle {
            self.begin();
        }
        if self.status != OtaStatus::Receiving {
            return;
        }

        let written = self.target.write(chunk).min(chunk.len());
        self.hasher.update(&chunk[..written]);
        self.bytes_written += written;

        if written != chunk.len() {
            self.fail(
                OtaError::ShortWrite {
                    written,
                    expected: chunk.len(),
                },
                true,
            );
        }
    }

    /// Ends the exchange and reports how it went. An upload that never
    /// delivered a byte fails without touching flash.
    pub fn finish(&mut self) -> OtaOutcome {
        match self.status {
            OtaStatus::Idle => self.fail(OtaError::Empty, false),
            OtaStatus::Receiving if self.bytes_written == 0 => self.fail(OtaError::Empty, true),
            OtaStatus::Receiving => {
                self.status = OtaStatus::Finalizing;
                match self.target.end() {
                    Ok(()) => {
                        self.status = OtaStatus::Complete;
                        let sha256 = hex_digest(std::mem::take(&mut self.hasher));
                        info!(
                            "ota: image complete, {} bytes, sha256 {sha256}",
                            self.bytes_written
                        );
                        return OtaOutcome::Complete {
                            bytes_written: self.bytes_written,
                            sha256,
                        };
                    }
                    Err(err) => self.fail(err, true),
                }
            }
            OtaStatus::Finalizing | OtaStatus::Complete | OtaStatus::Failed => {}
        }

        OtaOutcome::Failed(self.failure.clone().unwrap_or(OtaError::Empty))
    }

    /// The client went away before the body ended.
    pub fn disconnect(&mut self) {
        match self.status {
            OtaStatus::Idle | OtaStatus::Receiving => self.fail(OtaError::Disconnected, true),
            OtaStatus::Finalizing | OtaStatus::Complete | OtaStatus::Failed => {}
        }
    }

    /// Returns to `Idle` once the HTTP exchange is over.
    pub fn reset(&mut self) {
        self.status = OtaStatus::Idle;
        self.bytes_written = 0;
        self.hasher = Sha256::new();
        self.failure = None;
    }

    fn fail(&mut self, err: OtaError, abort_target: bool) {
        warn!("ota: failed after {} bytes: {err}", self.bytes_written);
        if abort_target {
            self.target.abort();
        }
        self.status = OtaStatus::Failed;
        self.failure = Some(err);
    }
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}


#[cfg(test)]
mod tests {
    use super::{scripted::ScriptedFlash, *};
    use pretty_assertions::assert_eq;

    #[test]
    fn streams_chunks_and_completes() {
        let mut session = OtaSession::new(ScriptedFlash::default());
        assert_eq!(session.status(), OtaStatus::Idle);

        session.write(b"\xE9abc");
        assert_eq!(session.status(), OtaStatus::Receiving);
        session.write(b"def");

        let outcome = session.finish();
        assert_eq!(session.status(), OtaStatus::Complete);
        assert_eq!(session.target().image, b"\xE9abcdef".to_vec());
        assert!(session.target().ended);
        match outcome {
            OtaOutcome::Complete {
                bytes_written,
                sha256,
            } => {
                assert_eq!(bytes_written, 7);
                assert_eq!(sha256.len(), 64);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn short_write_fails_and_next_upload_starts_clean() {
        let mut session = OtaSession::new(ScriptedFlash {
            short_write_on_call: Some(1),
            ..ScriptedFlash::default()
        });

        session.write(&[0xE9; 16]);
        assert_eq!(session.status(), OtaStatus::Failed);
        session.write(&[0x00; 16]);
        assert_eq!(session.target().write_calls, 1);

        let outcome = session.finish();
        assert_eq!(
            outcome,
            OtaOutcome::Failed(OtaError::ShortWrite {
                written: 15,
                expected: 16
            })
        );
        assert_eq!(session.target().aborts, 1);
        assert!(!session.target().ended);

        session.reset();
        assert_eq!(session.status(), OtaStatus::Idle);
        session.write(&[0xE9; 4]);
        assert_eq!(session.status(), OtaStatus::Receiving);
        assert_eq!(session.bytes_written(), 4);
        assert!(session.failure().is_none());
        assert!(matches!(session.finish(), OtaOutcome::Complete { .. }));
    }

    #[test]
    fn begin_failure_drains_without_writing() {
        let mut session = OtaSession::new(ScriptedFlash {
            fail_begin: true,
            ..ScriptedFlash::default()
        });

        session.write(b"chunk-one");
        session.write(b"chunk-two");

        assert_eq!(session.status(), OtaStatus::Failed);
        assert_eq!(session.target().write_calls, 0);
        assert!(matches!(
            session.finish(),
            OtaOutcome::Failed(OtaError::Begin(_))
        ));
    }

    #[test]
    fn finalize_rejection_reports_detail() {
        let mut session = OtaSession::new(ScriptedFlash {
            reject_end: Some("bad magic byte".to_string()),
            ..ScriptedFlash::default()
        });

        session.write(b"not-an-image");
        let outcome = session.finish();

        assert_eq!(session.status(), OtaStatus::Failed);
        assert_eq!(
            outcome,
            OtaOutcome::Failed(OtaError::Finalize("bad magic byte".to_string()))
        );
        assert_eq!(session.target().aborts, 1);
    }

    #[test]
    fn empty_upload_never_opens_flash() {
        let mut session = OtaSession::new(ScriptedFlash::default());
        session.write(b"");

        assert_eq!(session.finish(), OtaOutcome::Failed(OtaError::Empty));
        assert_eq!(session.target().begins, 0);
    }

    #[test]
    fn disconnect_mid_stream_discards_partial_image() {
        let mut session = OtaSession::new(ScriptedFlash::default());
        session.write(b"partial");
        session.disconnect();

        assert_eq!(session.status(), OtaStatus::Failed);
        assert!(session.target().image.is_empty());
        assert_eq!(session.finish(), OtaOutcome::Failed(OtaError::Disconnected));
    }
}
