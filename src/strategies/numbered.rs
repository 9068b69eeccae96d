//! Numbered-pagination strategy.

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::{pause, PaginationStrategy, Pass, StrategyOutcome};
use crate::session::js_string_array;

/// Click through a numbered pager: find the active page number, click the
/// link for the next number, repeat.
pub struct NumberedLinks;

pub(crate) fn click_next_number_script(
    number_selectors: &[String],
    active_selectors: &[String],
) -> String {
    format!(
        r#"(() => {{
  const digits = t => {{ const m = (t || '').trim().match(/^\d+$/); return m ? parseInt(m[0], 10) : null; }};
  let active = null;
  for (const sel of {active}) {{
    for (const el of document.querySelectorAll(sel)) {{
      const n = digits(el.textContent);
      if (n !== null) {{ active = n; break; }}
    }}
    if (active !== null) break;
  }}
  if (active === null) active = 1;
  for (const sel of {numbers}) {{
    for (const el of document.querySelectorAll(sel)) {{
      const n = digits(el.textContent);
      if (n === active + 1) {{
        el.scrollIntoView({{block: 'center'}});
        el.click();
        return n;
      }}
    }}
  }}
  return null;
}})()"#,
        active = js_string_array(active_selectors),
        numbers = js_string_array(number_selectors),
    )
}

/// Read the number shown by the active-page indicator, if any.
pub(crate) fn active_page_script(active_selectors: &[String]) -> String {
    format!(
        r#"(() => {{
  const digits = t => {{ const m = (t || '').trim().match(/^\d+$/); return m ? parseInt(m[0], 10) : null; }};
  for (const sel of {active}) {{
    for (const el of document.querySelectorAll(sel)) {{
      const n = digits(el.textContent);
      if (n !== null) return n;
    }}
  }}
  return null;
}})()"#,
        active = js_string_array(active_selectors),
    )
}

#[async_trait]
impl PaginationStrategy for NumberedLinks {
    fn name(&self) -> &'static str {
        "numbered-links"
    }

    async fn run(&self, pass: &mut Pass<'_>) -> Result<StrategyOutcome> {
        let site = pass.config.site.clone();
        let script =
            click_next_number_script(&site.page_number_selectors, &site.active_page_selectors);
        let mut advanced = false;

        for _ in 1..pass.config.pages.max(2) {
            if pass.should_stop() {
                return Ok(StrategyOutcome::Done);
            }
            let before = pass.session.visible_identities(&site).await.unwrap_or_default();
            let clicked: Option<u32> = pass.session.execute_js(&script).await.unwrap_or(None);
            let Some(page) = clicked else {
                return Ok(if advanced {
                    StrategyOutcome::Stalled
                } else {
                    StrategyOutcome::Unavailable
                });
            };
            pass.session
                .wait_identities_changed(&site, &before, 8_000)
                .await;
            let fresh = pass.absorb_all().await;
            debug!(page, fresh, "numbered hop");
            advanced = true;
            pause(pass.config).await;
        }
        Ok(StrategyOutcome::Stalled)
    }
}
