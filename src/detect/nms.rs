use super::result::Detection;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.4;

/// Greedy non-maximum suppression.
///
/// Drops proposals below `confidence_threshold`, sorts the rest by confidence
/// (descending, stable on ties) and keeps a box only when its IoU with every
/// already-kept box is at most `iou_threshold`.
pub fn non_max_suppression(
    detections: &[Detection],
    confidence_threshold: f32,
    iou_threshold: f32,
) -> Vec<Detection> {
    let mut candidates: Vec<&Detection> = detections
        .iter()
        .filter(|d| d.confidence >= confidence_threshold && !d.bbox.is_empty())
        .collect();
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let suppressed = kept
            .iter()
            .any(|k| k.bbox.iou(&candidate.bbox) > iou_threshold);
        if !suppressed {
            kept.push(candidate.clone());
        }
    }
    kept
}
