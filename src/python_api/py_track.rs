use pyo3::{pyclass, pymethods};

use crate::OutputTrack;

/// One emitted row: `(x1, y1, x2, y2, id, conf, class, det_id)`.
#[pyclass(name = "Track")]
pub struct PyTrack {
    pub inner: OutputTrack,
}

#[pymethods]
impl PyTrack {
    #[getter]
    fn bbox(&self) -> (f64, f64, f64, f64) {
        let [x1, y1, x2, y2] = self.inner.bbox;
        (x1, y1, x2, y2)
    }

    #[getter]
    fn id(&self) -> u32 {
        self.inner.id
    }

    #[getter]
    fn conf(&self) -> f64 {
        self.inner.conf
    }

    #[getter]
    fn class_id(&self) -> u32 {
        self.inner.class
    }

    #[getter]
    fn det_id(&self) -> i64 {
        self.inner.det_id
    }

    fn __repr__(&self) -> String {
        let [x1, y1, x2, y2] = self.inner.bbox;
        format!(
            "Track(id={}, bbox=({x1:.1}, {y1:.1}, {x2:.1}, {y2:.1}), conf={:.3}, class={})",
            self.inner.id, self.inner.conf, self.inner.class
        )
    }
}
