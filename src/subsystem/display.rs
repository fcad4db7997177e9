//! Operator feedback on the instrument front panel.

use crate::error::TspResult;
use crate::session::{syntax, TspSession};
use async_trait::async_trait;

/// Writes progress lines somewhere the operator can see them.
#[async_trait]
pub trait StatusDisplay: Send + Sync {
    /// Shows `text` on `row` (1 or 2).
    async fn display_line(&self, session: &TspSession, row: u8, text: &str) -> TspResult<()>;

    /// Clears the display.
    async fn clear(&self, session: &TspSession) -> TspResult<()>;
}

/// Front-panel display driven through the `display` TSP table.
#[derive(Debug, Clone, Copy, Default)]
pub struct TspDisplay;

#[async_trait]
impl StatusDisplay for TspDisplay {
    async fn display_line(&self, session: &TspSession, row: u8, text: &str) -> TspResult<()> {
        session
            .write_line(&syntax::display_line_command(row.clamp(1, 2), text))
            .await
    }

    async fn clear(&self, session: &TspSession) -> TspResult<()> {
        session.write_line(syntax::DISPLAY_CLEAR_COMMAND).await
    }
}

/// Display that shows nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDisplay;

#[async_trait]
impl StatusDisplay for NoDisplay {
    async fn display_line(&self, _session: &TspSession, _row: u8, _text: &str) -> TspResult<()> {
        Ok(())
    }

    async fn clear(&self, _session: &TspSession) -> TspResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::MockInstrument;

    #[tokio::test]
    async fn test_tsp_display_writes_lines() {
        let mock = MockInstrument::new();
        let session = TspSession::new(mock.clone(), SessionConfig::immediate());
        TspDisplay.display_line(&session, 3, "Saving \"foo\"").await.unwrap();
        TspDisplay.clear(&session).await.unwrap();
        assert_eq!(
            mock.writes(),
            vec![
                "display.setcursor(2,1) display.settext(\"Saving 'foo'\")".to_string(),
                "display.clear()".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_no_display_is_silent() {
        let mock = MockInstrument::new();
        let session = TspSession::new(mock.clone(), SessionConfig::immediate());
        NoDisplay.display_line(&session, 1, "x").await.unwrap();
        assert!(mock.writes().is_empty());
    }
}
