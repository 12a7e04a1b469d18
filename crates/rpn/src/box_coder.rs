//! Encoding of boxes as deviations from reference (anchor) boxes.
//!
//! A target box is encoded relative to a reference box as `(dx, dy, dw, dh)`:
//!
//! ```text
//! dx = wx * (target_cx - ref_cx) / ref_w
//! dy = wy * (target_cy - ref_cy) / ref_h
//! dw = ww * ln(target_w / ref_w)
//! dh = wh * ln(target_h / ref_h)
//! ```
//!
//! Both inputs and outputs of the codec are `[N, 4]` arrays of corner-corner (`xyxy`) boxes.

use ndarray::{Array2, ArrayView2};

use crate::iter::zip_exact;

/// Encodes and decodes box regression targets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxCoder {
    weights: [f32; 4],
    bbox_xform_clip: f32,
}

impl BoxCoder {
    /// Creates a box coder with the given `(wx, wy, ww, wh)` weights.
    ///
    /// Decoded scale deltas are clamped to `ln(1000 / 16)` before exponentiation.
    ///
    /// # Panics
    ///
    /// Panics if any weight is not strictly positive.
    pub fn new(weights: [f32; 4]) -> Self {
        Self::with_clip(weights, (1000.0f32 / 16.0).ln())
    }

    /// Creates a box coder with a custom clamp for decoded scale deltas.
    pub fn with_clip(weights: [f32; 4], bbox_xform_clip: f32) -> Self {
        assert!(
            weights.iter().all(|&w| w > 0.0),
            "box coder weights must be positive, got {weights:?}"
        );
        Self {
            weights,
            bbox_xform_clip,
        }
    }

    #[inline]
    pub fn weights(&self) -> [f32; 4] {
        self.weights
    }

    #[inline]
    pub fn bbox_xform_clip(&self) -> f32 {
        self.bbox_xform_clip
    }

    /// Computes regression targets that turn each `reference` box into its `target` box.
    ///
    /// References must have positive width and height; zero-sized references produce
    /// non-finite deltas.
    pub fn encode(
        &self,
        reference: ArrayView2<'_, f32>,
        target: ArrayView2<'_, f32>,
    ) -> Array2<f32> {
        let [wx, wy, ww, wh] = self.weights;
        let mut out = Array2::zeros((reference.nrows(), 4));
        let pairs = zip_exact(reference.outer_iter(), target.outer_iter());
        for ((r, t), mut o) in pairs.zip(out.outer_iter_mut()) {
            let (rcx, rcy, rw, rh) = center_size(r[0], r[1], r[2], r[3]);
            let (tcx, tcy, tw, th) = center_size(t[0], t[1], t[2], t[3]);

            o[0] = wx * (tcx - rcx) / rw;
            o[1] = wy * (tcy - rcy) / rh;
            o[2] = ww * (tw / rw).ln();
            o[3] = wh * (th / rh).ln();
        }
        out
    }

    /// Applies regression `deltas` to `reference` boxes, yielding corner-corner boxes.
    ///
    /// The scale deltas `dw / ww` and `dh / wh` are clamped to [`BoxCoder::bbox_xform_clip`]
    /// before exponentiation, so extreme predictions cannot overflow.
    pub fn decode(
        &self,
        deltas: ArrayView2<'_, f32>,
        reference: ArrayView2<'_, f32>,
    ) -> Array2<f32> {
        let [wx, wy, ww, wh] = self.weights;
        let mut out = Array2::zeros((reference.nrows(), 4));
        let pairs = zip_exact(deltas.outer_iter(), reference.outer_iter());
        for ((d, r), mut o) in pairs.zip(out.outer_iter_mut()) {
            let (cx, cy, w, h) = center_size(r[0], r[1], r[2], r[3]);

            let dx = d[0] / wx;
            let dy = d[1] / wy;
            let dw = (d[2] / ww).min(self.bbox_xform_clip);
            let dh = (d[3] / wh).min(self.bbox_xform_clip);

            let pred_cx = dx * w + cx;
            let pred_cy = dy * h + cy;
            let pred_w = dw.exp() * w;
            let pred_h = dh.exp() * h;

            o[0] = pred_cx - 0.5 * pred_w;
            o[1] = pred_cy - 0.5 * pred_h;
            o[2] = pred_cx + 0.5 * pred_w;
            o[3] = pred_cy + 0.5 * pred_h;
        }
        out
    }
}

impl Default for BoxCoder {
    fn default() -> Self {
        Self::new([1.0; 4])
    }
}

#[inline]
fn center_size(x1: f32, y1: f32, x2: f32, y2: f32) -> (f32, f32, f32, f32) {
    let w = x2 - x1;
    let h = y2 - y1;
    (x1 + 0.5 * w, y1 + 0.5 * h, w, h)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    use super::*;

    fn random_box(rng: &mut fastrand::Rng) -> [f32; 4] {
        let x = rng.f32() * 200.0;
        let y = rng.f32() * 200.0;
        let w = 10.0 + rng.f32() * 90.0;
        let h = 10.0 + rng.f32() * 90.0;
        [x, y, x + w, y + h]
    }

    #[test]
    fn roundtrip() {
        let mut rng = fastrand::Rng::with_seed(7);
        let coder = BoxCoder::new([10.0, 10.0, 5.0, 5.0]);
        for _ in 0..200 {
            let r = random_box(&mut rng);
            let t = random_box(&mut rng);
            let reference = Array2::from_shape_vec((1, 4), r.to_vec()).unwrap();
            let target = Array2::from_shape_vec((1, 4), t.to_vec()).unwrap();

            let deltas = coder.encode(reference.view(), target.view());
            let decoded = coder.decode(deltas.view(), reference.view());
            for (d, t) in decoded.iter().zip(&t) {
                assert_abs_diff_eq!(*d, *t, epsilon = 1e-2);
            }
        }
    }

    #[test]
    fn identity_deltas() {
        let coder = BoxCoder::default();
        let anchors = array![[0.0, 0.0, 16.0, 16.0], [10.0, 20.0, 42.0, 36.0]];
        let decoded = coder.decode(Array2::<f32>::zeros((2, 4)).view(), anchors.view());
        assert_eq!(decoded, anchors);
    }

    #[test]
    fn scale_is_clamped() {
        let coder = BoxCoder::default();
        let anchors = array![[0.0, 0.0, 16.0, 16.0]];
        let decoded = coder.decode(array![[0.0, 0.0, 1000.0, 80.0]].view(), anchors.view());
        assert!(decoded.iter().all(|v| v.is_finite()));

        // Clamped to ln(1000/16), which maps a 16px anchor to 1000px.
        assert_abs_diff_eq!(decoded[[0, 2]] - decoded[[0, 0]], 1000.0, epsilon = 1e-2);
        assert_abs_diff_eq!(decoded[[0, 3]] - decoded[[0, 1]], 1000.0, epsilon = 1e-2);
    }

    #[test]
    fn zero_reference_is_not_an_error() {
        let coder = BoxCoder::default();
        let deltas = coder.encode(
            array![[5.0, 5.0, 5.0, 5.0]].view(),
            array![[0.0, 0.0, 10.0, 10.0]].view(),
        );
        assert!(deltas.iter().any(|v| !v.is_finite()));
    }

    #[test]
    #[should_panic]
    fn rejects_zero_weight() {
        BoxCoder::new([1.0, 1.0, 0.0, 1.0]);
    }
}
