//! Report submission.
//!
//! A submission validates the draft, uploads up to two images concurrently,
//! and writes the report once, only after every attached upload completed.
//! The first failed upload aborts the submission; an upload that already
//! finished keeps its blob, unreferenced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use safeline_shared::{Report, SafelineError, UserId, ValidationError};
use safeline_store::DocumentStore;

use crate::upload::{UploadPipeline, UploadSource};

/// Fields entered by the reporter.
#[derive(Debug, Clone, Default)]
pub struct ReportDraft {
    pub name: String,
    pub mobile: String,
    pub description: String,
    pub licence_image: Option<UploadSource>,
    pub insurance_image: Option<UploadSource>,
}

impl ReportDraft {
    fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("name", &self.name),
            ("mobile", &self.mobile),
            ("description", &self.description),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::MissingField(field));
            }
        }
        Ok(())
    }
}

/// Upload percentages of the images of the submission in flight.
/// `None` for an image that is not attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmissionProgress {
    pub licence: Option<u8>,
    pub insurance: Option<u8>,
}

#[derive(Debug, Clone, Copy)]
enum ImageSlot {
    Licence,
    Insurance,
}

pub struct ReportSubmitter {
    store: Arc<dyn DocumentStore>,
    uploads: Arc<UploadPipeline>,
    submitting: AtomicBool,
    progress: watch::Sender<SubmissionProgress>,
}

/// Clears the in-flight flag however the submission ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ReportSubmitter {
    pub fn new(store: Arc<dyn DocumentStore>, uploads: Arc<UploadPipeline>) -> Self {
        let (progress, _) = watch::channel(SubmissionProgress::default());
        Self {
            store,
            uploads,
            submitting: AtomicBool::new(false),
            progress,
        }
    }

    pub fn is_submitting(&self) -> bool {
        self.submitting.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> watch::Receiver<SubmissionProgress> {
        self.progress.subscribe()
    }

    /// Submit `draft` on behalf of `reporter`. A second call while one is in
    /// flight is refused with [`SafelineError::SubmissionInProgress`].
    pub async fn submit(&self, reporter: &UserId, draft: ReportDraft) -> Result<Report, SafelineError> {
        if self
            .submitting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SafelineError::SubmissionInProgress);
        }
        let _in_flight = InFlight(&self.submitting);

        let result = self.run(reporter, draft).await;
        self.progress.send_replace(SubmissionProgress::default());
        result
    }

    async fn run(&self, reporter: &UserId, draft: ReportDraft) -> Result<Report, SafelineError> {
        draft.validate()?;

        self.progress.send_replace(SubmissionProgress {
            licence: draft.licence_image.as_ref().map(|_| 0),
            insurance: draft.insurance_image.as_ref().map(|_| 0),
        });

        let ReportDraft {
            name,
            mobile,
            description,
            licence_image,
            insurance_image,
        } = draft;

        // try_join drops the sibling on the first failure; its upload task
        // keeps running and its blob is left behind.
        let (licence_image, insurance_image) = futures::future::try_join(
            self.upload(ImageSlot::Licence, licence_image),
            self.upload(ImageSlot::Insurance, insurance_image),
        )
        .await
        .map_err(|e| {
            warn!(error = %e, "Report aborted by failed upload");
            e
        })?;

        let report = Report {
            id: String::new(),
            reporter_id: reporter.to_string(),
            name: name.trim().to_string(),
            mobile: mobile.trim().to_string(),
            licence_image,
            insurance_image,
            description: description.trim().to_string(),
            created_at: Utc::now(),
        };
        let stored = self.store.add_record(&report).await?;
        info!(id = %stored.id, reporter = %reporter.short(), "Report submitted");
        Ok(stored)
    }

    async fn upload(
        &self,
        slot: ImageSlot,
        source: Option<UploadSource>,
    ) -> Result<Option<String>, SafelineError> {
        let Some(source) = source else {
            return Ok(None);
        };
        let task = self.uploads.submit(source).await?;
        debug!(?slot, key = task.destination_key(), "Report image uploading");

        let mut progress = task.progress();
        let outcome = task.wait();
        tokio::pin!(outcome);
        loop {
            tokio::select! {
                result = &mut outcome => {
                    let address = result?;
                    self.publish(slot, 100);
                    return Ok(Some(address));
                }
                changed = progress.changed() => {
                    if changed.is_err() {
                        return Ok(Some((&mut outcome).await?));
                    }
                    let pct = progress.borrow_and_update().percent();
                    self.publish(slot, pct);
                }
            }
        }
    }

    fn publish(&self, slot: ImageSlot, pct: u8) {
        self.progress.send_modify(|p| match slot {
            ImageSlot::Licence => p.licence = Some(pct),
            ImageSlot::Insurance => p.insurance = Some(pct),
        });
    }
}
