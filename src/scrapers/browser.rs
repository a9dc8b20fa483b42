use crate::config::BrowserConfig;
use crate::error::SourceError;
use crate::filter::parse_submitted_date;
use crate::models::{LightListing, ListingId, ListingRecord};
use crate::scrapers::fields;
use crate::scrapers::traits::ListingSource;
use anyhow::{Context, Result};
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use scraper::{Html, Selector};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// A listing card as last seen on the result page
#[derive(Debug, Clone)]
struct Card {
    text: String,
}

/// Browser-based source for the Centris Matrix portal using headless Chrome.
///
/// One tab is kept for the whole session: the list page is loaded, a card is
/// clicked to open its detail panel, and the list is reloaded to close it.
pub struct CentrisBrowserSource {
    browser: Browser,
    tab: Arc<Tab>,
    portal_url: String,
    settings: BrowserConfig,
    cards: HashMap<ListingId, Card>,
}

impl CentrisBrowserSource {
    /// Launch Chrome and open a tab for the portal
    pub fn new(portal_url: &str, settings: &BrowserConfig) -> Result<Self> {
        info!("Launching headless Chrome...");

        let options = LaunchOptions::default_builder()
            .headless(settings.headless)
            .window_size(Some(settings.window_size))
            .build()
            .context("Failed to build launch options")?;

        let browser = Browser::new(options).context("Failed to launch Chrome browser")?;
        let tab = browser.new_tab().context("Failed to open browser tab")?;

        Ok(Self {
            browser,
            tab,
            portal_url: portal_url.to_string(),
            settings: settings.clone(),
            cards: HashMap::new(),
        })
    }

    fn ensure_alive(&self) -> Result<(), SourceError> {
        self.browser
            .get_version()
            .map(|_| ())
            .map_err(|e| SourceError::Session(e.to_string()))
    }

    fn evaluate_string(&self, js: &str) -> Result<String> {
        let result = self.tab.evaluate(js, false)?;
        Ok(result
            .value
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default())
    }

    fn evaluate_bool(&self, js: &str) -> Result<bool> {
        let result = self.tab.evaluate(js, false)?;
        Ok(result.value.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    fn scroll_height(&self) -> Result<i64> {
        let result = self.tab.evaluate("document.body.scrollHeight", false)?;
        Ok(result.value.and_then(|v| v.as_i64()).unwrap_or(0))
    }

    /// Load the result list, scroll until no more cards appear, and return the page HTML
    async fn load_list_page(&mut self) -> Result<String> {
        info!("Opening portal page...");
        self.tab.navigate_to(&self.portal_url)?;
        self.tab.wait_until_navigated()?;
        sleep(Duration::from_secs(self.settings.page_load_wait_secs)).await;

        let mut last_height = self.scroll_height()?;
        for attempt in 1..=self.settings.max_scrolls {
            self.tab
                .evaluate("window.scrollTo(0, document.body.scrollHeight);", false)?;
            sleep(Duration::from_secs(2)).await;

            let height = self.scroll_height()?;
            if height == last_height {
                break;
            }
            last_height = height;
            debug!("Scroll {}/{}", attempt, self.settings.max_scrolls);
        }
        self.tab.evaluate("window.scrollTo(0, 0);", false)?;

        let html = self.evaluate_string("document.documentElement.outerHTML")?;
        self.cards = index_cards(&html);
        debug!("{} listing cards indexed", self.cards.len());

        Ok(html)
    }

    fn save_debug_snapshot(&self, html: &str) {
        let Some(dir) = &self.settings.debug_dir else {
            return;
        };
        let written = std::fs::create_dir_all(dir)
            .and_then(|_| std::fs::write(dir.join("portal_page.html"), html));
        match written {
            Ok(()) => info!("Saved page HTML to {}/portal_page.html ({} bytes)", dir.display(), html.len()),
            Err(e) => warn!(error = %e, "Could not save page snapshot"),
        }
    }

    /// Click the card for `id` and wait for the detail panel to open
    async fn open_panel(&self, id: &ListingId) -> Result<bool> {
        let url_before = self.tab.get_url();
        if !self.evaluate_bool(&click_script(id))? {
            warn!(listing_id = %id, "No clickable card found");
            return Ok(false);
        }

        for _ in 0..10 {
            sleep(Duration::from_millis(500)).await;
            let url = self.tab.get_url();
            if url.contains('#') && url != url_before {
                debug!(listing_id = %id, url = %url, "Detail panel opened");
                sleep(Duration::from_secs(self.settings.panel_wait_secs)).await;
                return Ok(true);
            }
        }

        warn!(listing_id = %id, "Detail panel did not open");
        Ok(false)
    }

    /// Scroll through the open panel so lazy sections render, then read it
    async fn read_panel(&self, skip_photos: bool) -> Result<Map<String, Value>> {
        for _ in 0..5 {
            self.tab.evaluate("window.scrollBy(0, 500);", false)?;
            sleep(Duration::from_millis(500)).await;
        }
        self.tab.evaluate("window.scrollTo(0, 0);", false)?;
        sleep(Duration::from_secs(1)).await;

        // the result cards can stay in the page behind the panel, so only the
        // panel's own block is parsed when it can be told apart
        let html = self.evaluate_string("document.documentElement.outerHTML")?;
        let text = match panel_text(&html) {
            Some(text) => text,
            None => {
                debug!("No single-listing detail block found, reading the whole page");
                self.evaluate_string("document.body.innerText")?
            }
        };
        let photo_urls = if skip_photos {
            Vec::new()
        } else {
            fields::photo_urls_from_html(&html)
        };

        let mut detail = fields::parse_detail(&text, photo_urls);
        detail.insert("url".into(), Value::String(self.tab.get_url()));
        Ok(detail)
    }

    async fn extract_detail(&mut self, id: &ListingId, skip_photos: bool) -> Result<Option<ListingRecord>> {
        // the list must be freshly loaded: any open panel shifts the page
        self.load_list_page().await?;

        let Some(card) = self.cards.get(id).cloned() else {
            warn!(listing_id = %id, "Listing no longer on the result page");
            return Ok(None);
        };
        let list_fields = fields::parse_card(&card.text);

        let detail = if self.open_panel(id).await? {
            self.read_panel(skip_photos).await?
        } else {
            // list info alone is still returned; it will not count as detailed
            Map::new()
        };

        Ok(Some(fields::merge(id, list_fields, detail)))
    }
}

#[async_trait]
impl ListingSource for CentrisBrowserSource {
    async fn list_ids(&mut self) -> Result<Vec<ListingId>, SourceError> {
        self.ensure_alive()?;

        let html = self
            .load_list_page()
            .await
            .map_err(|e| SourceError::Discovery(format!("{:#}", e)))?;

        let ids = fields::find_listing_ids(&html);
        if ids.is_empty() {
            warn!("No listing found on the portal page");
            self.save_debug_snapshot(&html);
        } else {
            info!("{} listings found on the page", ids.len());
        }
        Ok(ids)
    }

    async fn extract_light(&mut self, id: &ListingId) -> Result<LightListing, SourceError> {
        self.ensure_alive()?;

        if !self.cards.contains_key(id) {
            self.load_list_page()
                .await
                .map_err(|e| SourceError::extraction(id, format!("{:#}", e)))?;
        }

        let fields = self
            .cards
            .get(id)
            .map(|card| fields::parse_card(&card.text))
            .unwrap_or_default();
        let submitted_date = fields
            .get("date_envoi")
            .and_then(Value::as_str)
            .and_then(|raw| {
                let parsed = parse_submitted_date(raw);
                if parsed.is_none() {
                    warn!(listing_id = %id, raw, "Unreadable submission date, keeping listing");
                }
                parsed
            });

        let mut light = LightListing::new(id.clone(), submitted_date);
        light.fields = fields;
        Ok(light)
    }

    async fn extract_full(
        &mut self,
        id: &ListingId,
        skip_photos: bool,
    ) -> Result<Option<ListingRecord>, SourceError> {
        self.ensure_alive()?;

        self.extract_detail(id, skip_photos)
            .await
            .map_err(|e| SourceError::extraction(id, format!("{:#}", e)))
    }

    fn source_name(&self) -> &'static str {
        "Centris Matrix"
    }
}

/// Map each listing id to the smallest block of the page describing it
fn index_cards(html: &str) -> HashMap<ListingId, Card> {
    let document = Html::parse_document(html);
    let div_selector = Selector::parse("div").unwrap();

    let mut cards: HashMap<ListingId, Card> = HashMap::new();
    for element in document.select(&div_selector) {
        let text = element.text().collect::<Vec<_>>().join("\n");
        if !text.contains('$') {
            continue;
        }
        let ids = fields::find_listing_ids(&text);
        let [id] = ids.as_slice() else {
            continue;
        };
        let smaller = cards
            .get(id)
            .map(|existing| text.len() < existing.text.len())
            .unwrap_or(true);
        if smaller {
            cards.insert(id.clone(), Card { text });
        }
    }
    cards
}

/// Sections only the detail panel shows, never a result card
const DETAIL_MARKERS: [&str; 5] = [
    "Revenus bruts",
    "Superficie du terrain",
    "Voir toutes les photos",
    "dépenses",
    "Source",
];

/// Text of the open detail panel: the largest block that names exactly one
/// listing and carries a detail-only section
fn panel_text(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let block_selector = Selector::parse("div, section, article").unwrap();

    document
        .select(&block_selector)
        .map(|element| element.text().collect::<Vec<_>>().join("\n"))
        .filter(|text| DETAIL_MARKERS.iter().any(|marker| text.contains(marker)))
        .filter(|text| fields::find_listing_ids(text).len() == 1)
        .max_by_key(|text| text.len())
}

/// JS that clicks the address link of the card showing `id`
fn click_script(id: &ListingId) -> String {
    let id_literal = serde_json::to_string(id.as_str()).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"
        (() => {{
            const id = {id_literal};
            const cards = Array.from(document.querySelectorAll('div')).filter(d =>
                /No\s*Centris/i.test(d.innerText) && d.innerText.includes(id) && d.innerText.includes('$'));
            if (!cards.length) return false;
            cards.sort((a, b) => a.innerText.length - b.innerText.length);
            const links = Array.from(cards[0].querySelectorAll('a'));
            const link = links.find(a => /Boul|Rue|Av\.|Ch\./.test(a.innerText)) || links[0];
            if (!link) return false;
            link.scrollIntoView({{ block: 'center' }});
            link.click();
            return true;
        }})()
        "#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_cards_picks_smallest_block() {
        let html = r#"<html><body><div id="results">
            <div class="card"><a>12 Rue Principale</a><span>549 000 $</span><span>No Centris : 111</span></div>
            <div class="card"><a>8 Boul. Hamel</a><span>310 000 $</span><span>No Centris : 222</span>
                <span>Date d'envoi : 2025-12-22</span></div>
        </div></body></html>"#;

        let cards = index_cards(html);
        assert_eq!(cards.len(), 2);
        let card = &cards[&ListingId::from("222")];
        assert!(card.text.contains("8 Boul. Hamel"));
        assert!(!card.text.contains("111"));
        let fields = fields::parse_card(&card.text);
        assert_eq!(fields["date_envoi"], "2025-12-22");
    }

    const PAGE_WITH_PANEL: &str = r#"<html><body><div id="app">
        <div id="results">
            <div class="card"><a>12 Rue Principale</a><span>549 000 $</span><span>No Centris : 111</span></div>
            <div class="card"><a>8 Boul. Hamel</a><span>310 000 $</span><span>No Centris : 222</span></div>
        </div>
        <div id="detail">
            <h2>1450 Ch. Sainte-Foy</h2><span>725 000 $</span>
            <div class="ids"><span>No Centris 333</span></div>
            <div class="finance"><span>Revenus bruts potentiels</span><span>61 200 $</span></div>
            <div class="source"><span>Source</span><span>GROUPE SUTTON Agence immobilière</span></div>
        </div>
    </div></body></html>"#;

    #[test]
    fn test_panel_text_ignores_cards_left_on_the_page() {
        let text = panel_text(PAGE_WITH_PANEL).unwrap();
        assert!(text.contains("No Centris 333"));
        assert!(!text.contains("111"));
        assert!(!text.contains("222"));

        let detail = fields::parse_detail(&text, Vec::new());
        assert_eq!(detail["numero_centris"], "333");
        assert_eq!(detail["prix"], "725000");
        assert_eq!(detail["donnees_financieres"]["revenus_bruts_potentiels"]["total"], "61200");
    }

    #[test]
    fn test_panel_text_absent_on_plain_result_page() {
        let html = r#"<html><body><div id="results">
            <div class="card"><span>549 000 $</span><span>No Centris : 111</span></div>
            <div class="card"><span>310 000 $</span><span>No Centris : 222</span></div>
        </div></body></html>"#;
        assert!(panel_text(html).is_none());
    }

    #[test]
    fn test_click_script_quotes_id() {
        let script = click_script(&ListingId::from("21609160"));
        assert!(script.contains(r#"const id = "21609160";"#));
    }
}
