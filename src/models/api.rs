use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::AreaOfInterest;

/// Request to create an alignment job.
///
/// Every field is optional at the serde level so that a missing field is
/// reported as a validation error (400) rather than a deserialization
/// rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    #[garde(required, length(min = 1, max = 255))]
    #[serde(alias = "imageAId")]
    pub image_a_ref: Option<String>,

    #[garde(required, length(min = 1, max = 255))]
    #[serde(alias = "imageBId")]
    pub image_b_ref: Option<String>,

    #[garde(required, dive)]
    pub aoi: Option<AreaOfInterest>,
}

/// Response after creating a job.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: Uuid,
}

/// Response after storing an uploaded image.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub image_id: String,
    pub filename: String,
    pub size: u64,
}
