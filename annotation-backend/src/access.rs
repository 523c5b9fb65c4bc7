use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{BlueprintImage, Role, User};
use crate::store::AnnotationStore;

/// The requester must own the image or hold the estimator role
pub fn authorize(store: &dyn AnnotationStore, image: &BlueprintImage, requester: Uuid) -> PipelineResult<User> {
    let user = match store.user(requester) {
        Ok(user) => user,
        Err(PipelineError::NotFound { .. }) => {
            return Err(PipelineError::PermissionDenied(format!("unknown user {}", requester)))
        }
        Err(err) => return Err(err),
    };

    if user.id == image.owner_id || user.role == Role::Estimator {
        Ok(user)
    } else {
        Err(PipelineError::PermissionDenied(format!(
            "user {} may not modify blueprint image {}",
            user.id, image.id
        )))
    }
}
