// ABOUTME: Shields-style SVG badge showing whether a job reproduced
// ABOUTME: Tri-state: success, partial (non-zero exit) and failure

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadgeStatus {
    /// Exited with code 0
    Success,
    /// Ran to completion with a non-zero exit code
    Partial,
    /// The pipeline failed before or during execution
    Failure,
}

impl BadgeStatus {
    pub fn label(&self) -> &'static str {
        match self {
            BadgeStatus::Success => "success",
            BadgeStatus::Partial => "partial",
            BadgeStatus::Failure => "failure",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            BadgeStatus::Success => "#10B981",
            BadgeStatus::Partial => "#F59E0B",
            BadgeStatus::Failure => "#EF4444",
        }
    }
}

const LABEL: &str = "reproducible";
const LABEL_COLOR: &str = "#555";
const CHAR_WIDTH: usize = 7;
const PADDING: usize = 10;

pub fn render_badge(status: BadgeStatus) -> String {
    let message = status.label();
    let left = LABEL.len() * CHAR_WIDTH + PADDING;
    let right = message.len() * CHAR_WIDTH + PADDING;
    let total = left + right;

    format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{total}" height="20" role="img" aria-label="{LABEL}: {message}">
  <title>{LABEL}: {message}</title>
  <linearGradient id="s" x2="0" y2="100%">
    <stop offset="0" stop-color="#bbb" stop-opacity=".1"/>
    <stop offset="1" stop-opacity=".1"/>
  </linearGradient>
  <clipPath id="r"><rect width="{total}" height="20" rx="3" fill="#fff"/></clipPath>
  <g clip-path="url(#r)">
    <rect width="{left}" height="20" fill="{LABEL_COLOR}"/>
    <rect x="{left}" width="{right}" height="20" fill="{color}"/>
    <rect width="{total}" height="20" fill="url(#s)"/>
  </g>
  <g fill="#fff" text-anchor="middle" font-family="Verdana,Geneva,DejaVu Sans,sans-serif" font-size="11">
    <text x="{label_x}" y="14">{LABEL}</text>
    <text x="{message_x}" y="14">{message}</text>
  </g>
</svg>
"##,
        color = status.color(),
        label_x = left / 2,
        message_x = left + right / 2,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_badge_colors_follow_status() {
        let success = render_badge(BadgeStatus::Success);
        assert!(success.contains("fill=\"#10B981\""));
        assert!(success.contains(">success</text>"));

        let partial = render_badge(BadgeStatus::Partial);
        assert!(partial.contains("fill=\"#F59E0B\""));

        let failure = render_badge(BadgeStatus::Failure);
        assert!(failure.contains("fill=\"#EF4444\""));
        assert!(failure.starts_with("<svg"));
    }
}
