//! Extraction of a peak list directly from an in-memory message payload
//! (the pub/sub/request-reply transport), bypassing any file
//! container entirely.

use crate::geometry::Image;
use crate::types::PeakList;

pub fn extract_from_payload(image: &Image) -> Option<PeakList> {
    image.prepared_peaks.clone()
}
