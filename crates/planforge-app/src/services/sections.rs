//! The fixed catalog of report sections.
//!
//! Each section is a pure prompt builder over the idea, the target location,
//! and the shared context computed once per job. Sections never depend on
//! each other's output.

/// Shared values computed once per job and passed unchanged into every
/// section so outputs stay mutually consistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedContext {
    pub summary: String,
    pub currency: String,
}

/// One named report section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub name: &'static str,
    title: &'static str,
    brief: &'static str,
}

impl Section {
    pub fn prompt(&self, idea: &str, location: &str, shared: &SharedContext) -> String {
        format!(
            "You are writing the \"{title}\" section of a business report.\n\
             Business idea: {idea}\n\
             Target location: {location}\n\
             Target currency: {currency} (use it for every monetary figure)\n\n\
             Overall context summary:\n{summary}\n\n\
             {brief}\n\
             Write the section in clear Markdown, grounded in the context above.",
            title = self.title,
            idea = idea,
            location = location,
            currency = shared.currency,
            summary = shared.summary,
            brief = self.brief,
        )
    }
}

const fn section(name: &'static str, title: &'static str, brief: &'static str) -> Section {
    Section { name, title, brief }
}

/// The full catalog, in report order.
pub const SECTION_CATALOG: &[Section] = &[
    section(
        "executive_summary",
        "Executive Summary",
        "Summarize the opportunity, the proposed solution, and the expected outcome in a few tight paragraphs.",
    ),
    section(
        "problem_validation",
        "Problem Validation",
        "Validate that the underlying problem is real, painful, and frequent for the target audience, citing observable signals.",
    ),
    section(
        "market_analysis",
        "Market Analysis",
        "Describe the target market, its segments, current trends, and relevant local dynamics.",
    ),
    section(
        "market_size_estimation",
        "Market Size Estimation",
        "Estimate TAM, SAM, and SOM with explicit assumptions and monetary figures.",
    ),
    section(
        "swot_analysis",
        "SWOT Analysis",
        "List strengths, weaknesses, opportunities, and threats, each with a short justification.",
    ),
    section(
        "vrio_analysis",
        "VRIO Analysis",
        "Assess value, rarity, imitability, and organization for the idea's key resources.",
    ),
    section(
        "pestel_analysis",
        "PESTEL Analysis",
        "Cover political, economic, social, technological, environmental, and legal factors in the target location.",
    ),
    section(
        "porters_five_forces",
        "Porter's Five Forces",
        "Analyze supplier power, buyer power, competitive rivalry, threat of substitution, and threat of new entry.",
    ),
    section(
        "competitive_analysis",
        "Competitive Analysis",
        "Identify direct and indirect competitors and position the idea against them.",
    ),
    section(
        "usp",
        "Unique Selling Proposition",
        "State the single clearest reason a customer would choose this product over every alternative.",
    ),
    section(
        "customer_persona",
        "Customer Persona",
        "Sketch the primary customer persona: demographics, goals, frustrations, and buying behavior.",
    ),
    section(
        "mvp",
        "Minimum Viable Product",
        "Define the smallest product that tests the riskiest assumption, with a build plan.",
    ),
    section(
        "strategy",
        "Strategy",
        "Lay out the overall business strategy and the sequencing of major bets.",
    ),
    section(
        "go_to_market_strategy",
        "Go-to-Market Strategy",
        "Describe how the product reaches its first customers and expands from there.",
    ),
    section(
        "marketing_strategy",
        "Marketing Strategy",
        "Propose positioning, messaging, and the marketing mix for the target market.",
    ),
    section(
        "marketing_channels",
        "Marketing Channels",
        "Rank the acquisition channels worth testing first and the expected cost profile of each.",
    ),
    section(
        "social_media_strategy",
        "Social Media Strategy",
        "Recommend platforms, cadence, and content pillars suited to the audience.",
    ),
    section(
        "slogan",
        "Slogan",
        "Propose three candidate slogans and pick the strongest, explaining why.",
    ),
    section(
        "finances",
        "Finances",
        "Project startup costs, a simple revenue model, and a break-even estimate with monetary figures.",
    ),
    section(
        "venture_insights",
        "Venture Insights",
        "Highlight what investors would find most and least attractive about this venture.",
    ),
    section(
        "industry_insights",
        "Industry Insights",
        "Surface the industry-specific dynamics and benchmarks a newcomer must know.",
    ),
    section(
        "catwoe_analysis",
        "CATWOE Analysis",
        "Work through customers, actors, transformation, worldview, owners, and environmental constraints.",
    ),
];

/// Names of the sections a free-tier job generates.
const FREE_SECTION_NAMES: &[&str] = &[
    "executive_summary",
    "problem_validation",
    "market_analysis",
    "swot_analysis",
    "competitive_analysis",
    "usp",
    "customer_persona",
    "mvp",
    "strategy",
    "marketing_strategy",
    "slogan",
    "finances",
];

/// The full section set run by paid and upgrade jobs.
#[must_use]
pub fn paid_sections() -> Vec<Section> {
    SECTION_CATALOG.to_vec()
}

/// The cheaper subset run by free-tier jobs.
#[must_use]
pub fn free_sections() -> Vec<Section> {
    SECTION_CATALOG
        .iter()
        .filter(|section| FREE_SECTION_NAMES.contains(&section.name))
        .copied()
        .collect()
}

/// Prompt for the shared context summary, computed once per job.
#[must_use]
pub fn summary_prompt(idea: &str, location: &str) -> String {
    format!(
        "Generate a concise (maximum 150 words) overall context summary in plain text \
         for a business report about the idea: '{idea}' in the location: '{location}'. \
         Cover the core problem, the audience, and the local market in 2-3 short paragraphs."
    )
}

/// Prompt for currency detection. The answer is validated strictly and falls
/// back to a fixed code when it does not parse.
#[must_use]
pub fn currency_prompt(location: &str) -> String {
    format!(
        "What is the 3-letter ISO 4217 currency code for '{location}'? \
         Respond with the code only, nothing else."
    )
}
