//! Listing Form Workflow
//!
//! Drives the "new listing" screen: photo uploads into the tray, field
//! validation, submission and resumption after a failed write.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::assets::{AssetError, AssetTray, ImageAsset, SelectedFile, UploadPipeline};
use crate::auth::Session;
use crate::listing::{Listing, ListingError, ListingFields, ListingRepository};
use crate::validation::{ListingDraft, ValidationError};

/// A write that failed, keyed by the asset ids it carried
#[derive(Debug, Clone)]
struct PendingSubmission {
    owner_uid: String,
    fields: ListingFields,
    asset_ids: Vec<String>,
}

#[derive(Debug, Clone)]
struct CompletedSubmission {
    asset_ids: Vec<String>,
    listing: Listing,
}

#[derive(Debug, Default)]
struct SubmissionLog {
    pending: Option<PendingSubmission>,
    completed: Option<CompletedSubmission>,
}

/// State behind one "new listing" form
pub struct ListingForm {
    pipeline: UploadPipeline,
    repository: Arc<ListingRepository>,
    tray: AssetTray,
    submissions: Mutex<SubmissionLog>,
    // One write in flight at a time
    submitting: tokio::sync::Mutex<()>,
}

impl ListingForm {
    pub fn new(pipeline: UploadPipeline, repository: Arc<ListingRepository>) -> Self {
        Self {
            pipeline,
            repository,
            tray: AssetTray::new(),
            submissions: Mutex::new(SubmissionLog::default()),
            submitting: tokio::sync::Mutex::new(()),
        }
    }

    fn log(&self) -> std::sync::MutexGuard<'_, SubmissionLog> {
        self.submissions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Upload a photo and append it to the tray once it completes.
    ///
    /// Safe to call concurrently; the tray ends up in completion order.
    pub async fn add_image(
        &self,
        file: SelectedFile,
        session: &Session,
    ) -> Result<ImageAsset, AssetError> {
        let asset = self.pipeline.upload(file, &session.uid).await?;
        self.tray.push(asset.clone());
        debug!("Tray holds {} images", self.tray.len());
        Ok(asset)
    }

    /// Delete a tray photo from storage; it stays in the tray if that fails
    pub async fn remove_image(&self, asset_id: &str) -> Result<ImageAsset, AssetError> {
        let asset = self
            .tray
            .find(asset_id)
            .ok_or_else(|| AssetError::NotFound(asset_id.to_string()))?;
        self.pipeline.delete_asset(&asset).await?;
        self.tray.remove(asset_id);
        Ok(asset)
    }

    /// Photos uploaded so far, in completion order
    pub fn images(&self) -> Vec<ImageAsset> {
        self.tray.snapshot()
    }

    /// Validate `draft` and write it with every uploaded photo
    pub async fn submit(
        &self,
        draft: &ListingDraft,
        session: &Session,
    ) -> Result<Listing, SubmissionError> {
        let _writing = self.submitting.lock().await;

        let images = self.tray.snapshot();
        let mut fields = match draft.validate() {
            Ok(fields) if !images.is_empty() => fields,
            Ok(_) => return Err(ValidationError::no_images().into()),
            Err(errors) => {
                return Err(ValidationError {
                    fields: errors,
                    missing_images: images.is_empty(),
                }
                .into())
            }
        };
        fields.name = fields.name.to_uppercase();

        self.write(fields, session, images).await
    }

    /// Retry the last failed submission of `session`'s user with the photos
    /// now in the tray.
    ///
    /// When the last submission succeeded and the tray holds nothing beyond
    /// the photos it carried, the stored listing is returned without writing
    /// again. Photos added after that success are a new submission, not a
    /// resume.
    pub async fn resume_submission(&self, session: &Session) -> Result<Listing, SubmissionError> {
        let _writing = self.submitting.lock().await;

        let images = self.tray.snapshot();
        let asset_ids: Vec<String> = images.iter().map(|a| a.asset_id.clone()).collect();

        let pending = {
            let log = self.log();
            match (&log.pending, &log.completed) {
                (Some(pending), _) if pending.owner_uid == session.uid => pending.clone(),
                (None, Some(done))
                    if done.listing.owner_uid == session.uid
                        && asset_ids.iter().all(|id| done.asset_ids.contains(id)) =>
                {
                    debug!("Submission {} already completed", done.listing.id);
                    return Ok(done.listing.clone());
                }
                _ => return Err(SubmissionError::NothingToResume),
            }
        };

        if images.is_empty() {
            return Err(ValidationError::no_images().into());
        }
        if pending.asset_ids != asset_ids {
            info!(
                "Resuming submission of {} with a changed photo set ({} -> {})",
                pending.fields.name,
                pending.asset_ids.len(),
                asset_ids.len()
            );
        } else {
            info!("Resuming submission of {}", pending.fields.name);
        }

        self.write(pending.fields, session, images).await
    }

    async fn write(
        &self,
        fields: ListingFields,
        session: &Session,
        images: Vec<ImageAsset>,
    ) -> Result<Listing, SubmissionError> {
        let asset_ids: Vec<String> = images.iter().map(|a| a.asset_id.clone()).collect();

        match self.repository.create_listing(&fields, session, &images).await {
            Ok(listing) => {
                self.tray.remove_all(&asset_ids);
                let mut log = self.log();
                log.pending = None;
                log.completed = Some(CompletedSubmission {
                    asset_ids,
                    listing: listing.clone(),
                });
                Ok(listing)
            }
            Err(e) => {
                warn!("Submission failed, keeping {} images for retry: {}", asset_ids.len(), e);
                self.log().pending = Some(PendingSubmission {
                    owner_uid: session.uid.clone(),
                    fields,
                    asset_ids,
                });
                Err(SubmissionError::Write(e))
            }
        }
    }

    /// Forget tray contents and submission history.
    ///
    /// Uploaded photos that were never submitted stay in storage.
    pub fn reset(&self) {
        let orphaned = self.tray.len();
        self.tray.clear();
        *self.log() = SubmissionLog::default();
        if orphaned > 0 {
            warn!("Form reset with {} unsubmitted images", orphaned);
        }
    }
}

/// Submission errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubmissionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Write(ListingError),

    #[error("No failed submission to resume")]
    NothingToResume,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::LISTINGS_COLLECTION;
    use crate::testing::{
        selected_file, session_for, valid_draft, MemoryDocumentStore, MemoryObjectStorage,
    };
    use crate::validation::Field;
    use std::sync::atomic::Ordering;

    struct Harness {
        form: Arc<ListingForm>,
        documents: Arc<MemoryDocumentStore>,
        objects: Arc<MemoryObjectStorage>,
    }

    fn harness() -> Harness {
        let documents = Arc::new(MemoryDocumentStore::default());
        let objects = Arc::new(MemoryObjectStorage::default());
        let repository = Arc::new(ListingRepository::new(documents.clone(), objects.clone()));
        let form = ListingForm::new(UploadPipeline::new(objects.clone()), repository);
        Harness {
            form: Arc::new(form),
            documents,
            objects,
        }
    }

    fn written_image_ids(documents: &MemoryDocumentStore, call: usize) -> Vec<String> {
        documents.create_calls.lock().unwrap()[call]["images"]
            .as_array()
            .unwrap()
            .iter()
            .map(|image| image["name"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn valid_submission_writes_once_with_uppercased_name() {
        let h = harness();
        let session = session_for("u1");
        let a = h.form.add_image(selected_file("a.jpg", "image/jpeg"), &session).await.unwrap();
        let b = h.form.add_image(selected_file("b.png", "image/png"), &session).await.unwrap();

        let listing = h.form.submit(&valid_draft(), &session).await.unwrap();

        assert_eq!(listing.fields.name, "AUDI RS3");
        assert_eq!(h.documents.create_calls.lock().unwrap().len(), 1);
        assert_eq!(h.documents.create_calls.lock().unwrap()[0]["name"], "AUDI RS3");
        assert_eq!(written_image_ids(&h.documents, 0), vec![a.asset_id, b.asset_id]);
        assert!(h.form.images().is_empty());
    }

    #[tokio::test]
    async fn missing_field_never_reaches_repository() {
        let h = harness();
        let session = session_for("u1");
        h.form.add_image(selected_file("a.jpg", "image/jpeg"), &session).await.unwrap();
        let draft = ListingDraft { price: String::new(), ..valid_draft() };

        let err = h.form.submit(&draft, &session).await.unwrap_err();

        let SubmissionError::Validation(err) = err else {
            panic!("expected validation error, got {err:?}");
        };
        assert_eq!(err.field_error(Field::Price), Some("O preço é obrigatório"));
        assert!(!err.missing_images);
        assert!(h.documents.create_calls.lock().unwrap().is_empty());
        assert_eq!(h.form.images().len(), 1);
    }

    #[tokio::test]
    async fn zero_images_is_rejected_whatever_the_fields() {
        let h = harness();
        let session = session_for("u1");

        for draft in [valid_draft(), ListingDraft::default()] {
            let err = h.form.submit(&draft, &session).await.unwrap_err();
            let SubmissionError::Validation(err) = err else {
                panic!("expected validation error, got {err:?}");
            };
            assert!(err.missing_images);
            assert!(err.to_string().contains("no images"));
        }
        assert!(h.documents.create_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_write_keeps_tray_and_resume_reuses_it() {
        let h = harness();
        let session = session_for("u1");
        let asset = h.form.add_image(selected_file("a.jpg", "image/jpeg"), &session).await.unwrap();
        h.documents.fail_writes.store(true, Ordering::SeqCst);

        let err = h.form.submit(&valid_draft(), &session).await.unwrap_err();
        assert!(matches!(err, SubmissionError::Write(ListingError::Write(_))));
        assert_eq!(h.form.images(), vec![asset.clone()]);

        h.documents.fail_writes.store(false, Ordering::SeqCst);
        let listing = h.form.resume_submission(&session).await.unwrap();

        assert_eq!(listing.fields.name, "AUDI RS3");
        assert_eq!(written_image_ids(&h.documents, 1), vec![asset.asset_id]);
        assert_eq!(h.objects.object_count(), 1);
        assert!(h.form.images().is_empty());
        assert_eq!(h.documents.len(LISTINGS_COLLECTION), 1);
    }

    #[tokio::test]
    async fn resume_after_success_does_not_write_again() {
        let h = harness();
        let session = session_for("u1");
        h.form.add_image(selected_file("a.jpg", "image/jpeg"), &session).await.unwrap();

        assert_eq!(
            h.form.resume_submission(&session).await.unwrap_err(),
            SubmissionError::NothingToResume
        );

        let listing = h.form.submit(&valid_draft(), &session).await.unwrap();
        let resumed = h.form.resume_submission(&session).await.unwrap();

        assert_eq!(resumed, listing);
        assert_eq!(h.documents.create_calls.lock().unwrap().len(), 1);
        assert_eq!(
            h.form.resume_submission(&session_for("u2")).await.unwrap_err(),
            SubmissionError::NothingToResume
        );
    }

    #[tokio::test]
    async fn photos_added_after_success_are_not_a_resume() {
        let h = harness();
        let session = session_for("u1");
        h.form.add_image(selected_file("a.jpg", "image/jpeg"), &session).await.unwrap();
        h.form.submit(&valid_draft(), &session).await.unwrap();
        let b = h.form.add_image(selected_file("b.jpg", "image/jpeg"), &session).await.unwrap();

        assert_eq!(
            h.form.resume_submission(&session).await.unwrap_err(),
            SubmissionError::NothingToResume
        );
        assert_eq!(h.documents.create_calls.lock().unwrap().len(), 1);
        assert_eq!(h.form.images(), vec![b]);
    }

    #[tokio::test]
    async fn another_user_cannot_resume_a_failed_submission() {
        let h = harness();
        let owner = session_for("u1");
        h.form.add_image(selected_file("a.jpg", "image/jpeg"), &owner).await.unwrap();
        h.documents.fail_writes.store(true, Ordering::SeqCst);
        h.form.submit(&valid_draft(), &owner).await.unwrap_err();
        h.documents.fail_writes.store(false, Ordering::SeqCst);

        assert_eq!(
            h.form.resume_submission(&session_for("u2")).await.unwrap_err(),
            SubmissionError::NothingToResume
        );
        assert_eq!(h.documents.create_calls.lock().unwrap().len(), 1);

        let listing = h.form.resume_submission(&owner).await.unwrap();
        assert_eq!(listing.owner_uid, "u1");
    }

    #[tokio::test]
    async fn concurrent_uploads_land_in_completion_order() {
        let h = harness();
        let session = session_for("u1");
        let release_jpeg = h.objects.gate("image/jpeg");

        let jpg = {
            let form = Arc::clone(&h.form);
            let session = session.clone();
            tokio::spawn(async move {
                form.add_image(selected_file("photo.jpg", "image/jpeg"), &session).await
            })
        };
        let png = {
            let form = Arc::clone(&h.form);
            let session = session.clone();
            tokio::spawn(async move {
                form.add_image(selected_file("photo.png", "image/png"), &session).await
            })
        };

        let png = png.await.unwrap().unwrap();
        release_jpeg.send(()).unwrap();
        let jpg = jpg.await.unwrap().unwrap();

        let ids: Vec<_> = h.form.images().into_iter().map(|a| a.asset_id).collect();
        assert_eq!(ids, vec![png.asset_id, jpg.asset_id]);
    }

    #[tokio::test]
    async fn gif_leaves_tray_unchanged() {
        let h = harness();
        let session = session_for("u1");
        h.form.add_image(selected_file("a.jpg", "image/jpeg"), &session).await.unwrap();

        let err = h
            .form
            .add_image(selected_file("photo.gif", "image/gif"), &session)
            .await
            .unwrap_err();

        assert!(matches!(err, AssetError::UnsupportedType(_)));
        assert_eq!(h.form.images().len(), 1);
    }

    #[tokio::test]
    async fn remove_image_keeps_asset_when_delete_fails() {
        let h = harness();
        let session = session_for("u1");
        let keep = h.form.add_image(selected_file("a.jpg", "image/jpeg"), &session).await.unwrap();
        let gone = h.form.add_image(selected_file("b.jpg", "image/jpeg"), &session).await.unwrap();
        h.objects.fail_delete_of(&keep.storage_path());

        assert!(matches!(
            h.form.remove_image(&keep.asset_id).await,
            Err(AssetError::Delete(_))
        ));
        h.form.remove_image(&gone.asset_id).await.unwrap();
        assert_eq!(
            h.form.remove_image("missing").await.unwrap_err(),
            AssetError::NotFound("missing".into())
        );

        assert_eq!(h.form.images(), vec![keep]);
        assert!(!h.objects.contains(&gone.storage_path()));
    }

    #[tokio::test]
    async fn reset_clears_tray_and_history() {
        let h = harness();
        let session = session_for("u1");
        h.form.add_image(selected_file("a.jpg", "image/jpeg"), &session).await.unwrap();
        h.documents.fail_writes.store(true, Ordering::SeqCst);
        h.form.submit(&valid_draft(), &session).await.unwrap_err();

        h.form.reset();

        assert!(h.form.images().is_empty());
        assert_eq!(
            h.form.resume_submission(&session).await.unwrap_err(),
            SubmissionError::NothingToResume
        );
    }
}
