use obs_ocr_core::TextObservation;

/// Geometry of the message box the client reads text from, in the
/// normalised bottom-left-origin space the recognizers report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutParams {
    /// `y` of the first line's baseline band.
    pub top: f64,
    pub line_height: f64,
    pub min_left: f64,
    pub max_right: f64,
    pub min_height: f64,
}

impl Default for LayoutParams {
    fn default() -> Self {
        Self {
            top: 0.22,
            line_height: 0.06,
            min_left: 0.14,
            max_right: 0.8,
            min_height: 0.025,
        }
    }
}

impl LayoutParams {
    fn line_number(&self, observation: &TextObservation) -> f64 {
        ((self.top - observation.bounding_box.y) / self.line_height).floor()
    }

    fn accepts(&self, observation: &TextObservation) -> bool {
        self.line_number(observation) >= 0.0
            && observation.left() >= self.min_left
            && observation.right() <= self.max_right
            && observation.bounding_box.height >= self.min_height
    }
}

/// Buckets observations into text lines, top to bottom, and joins each
/// line's fragments left to right.
pub fn arrange_lines(observations: &[TextObservation], params: &LayoutParams) -> Vec<String> {
    let mut placed: Vec<(i64, f64, &str)> = observations
        .iter()
        .filter(|observation| params.accepts(observation))
        .map(|observation| {
            (
                params.line_number(observation) as i64,
                observation.left(),
                observation.text.as_str(),
            )
        })
        .collect();
    placed.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));

    let mut lines: Vec<(i64, String)> = Vec::new();
    for (line, _, text) in placed {
        match lines.last_mut() {
            Some((current, joined)) if *current == line => joined.push_str(text),
            _ => lines.push((line, text.to_owned())),
        }
    }
    lines.into_iter().map(|(_, text)| text).collect()
}
