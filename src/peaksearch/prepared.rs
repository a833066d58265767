//! Prepared peak lists read from the image container itself rather than
//! computed: a plain HDF5 dataset, or a CXI-style table indexed per event.
//! Both simply hand back whatever the loader already attached to the
//! image; the container-specific lookup is the external collaborator's
//! job.

use crate::error::{EngineError, ImageProcessError};
use crate::geometry::Image;
use crate::types::PeakList;

pub fn from_hdf5_table(image: &Image) -> Result<PeakList, EngineError> {
    image.prepared_peaks.clone().ok_or_else(|| {
        EngineError::ImageProcess(ImageProcessError::PeakSearchFailed {
            method: "prepared-hdf5".to_string(),
            reason: "image has no precomputed peak table".to_string(),
        })
    })
}

pub fn from_cxi_table(image: &Image) -> Result<PeakList, EngineError> {
    image.prepared_peaks.clone().ok_or_else(|| {
        EngineError::ImageProcess(ImageProcessError::PeakSearchFailed {
            method: "prepared-cxi".to_string(),
            reason: "event has no row in the CXI peak table".to_string(),
        })
    })
}
