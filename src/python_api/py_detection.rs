use pyo3::{pyclass, pymethods};

use crate::Detection;

/// One per-frame input row: `(x1, y1, x2, y2)` in image pixels, a confidence in
/// `[0, 1]` and an integer class id.
#[pyclass(name = "Detection")]
#[derive(Clone)]
pub struct PyDetection {
    pub inner: Detection,
}

#[pymethods]
impl PyDetection {
    #[new]
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64, conf: f64, class: u32) -> Self {
        Self {
            inner: Detection { bbox: [x1, y1, x2, y2], conf, class },
        }
    }

    #[getter]
    fn bbox(&self) -> (f64, f64, f64, f64) {
        let [x1, y1, x2, y2] = self.inner.bbox;
        (x1, y1, x2, y2)
    }

    #[getter]
    fn conf(&self) -> f64 {
        self.inner.conf
    }

    #[getter]
    fn class_id(&self) -> u32 {
        self.inner.class
    }
}
