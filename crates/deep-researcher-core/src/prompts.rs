//! Prompt templates for every model-facing step of the workflow.

use chrono::Local;

/// Today's date as shown in prompts, e.g. `Mon Jan 15, 2024`.
pub fn today_str() -> String {
    Local::now().format("%a %b %-d, %Y").to_string()
}

/// First `max_chars` characters of `text`, never splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

pub fn clarify_with_user_instructions(messages: &str, date: &str) -> String {
    format!(
        r#"These are the messages exchanged so far with the user asking for a research report:
<Messages>
{messages}
</Messages>

Today's date is {date}.

Decide whether you need to ask the user one clarifying question before research can start,
or whether you already have enough to begin.

Rules:
- If you already asked a clarifying question in the messages above, do not ask another one
  unless something essential is still missing.
- Ask only when the scope, the audience or an acronym is genuinely ambiguous.
- Keep the question short and use markdown bullets if you list options.

Respond in valid JSON with exactly these keys:
"need_clarification": boolean,
"question": "<the question to ask, or empty>",
"verification": "<a short acknowledgement that research will now start, or empty>"

If you need to ask, return need_clarification=true, the question, and an empty verification.
If you do not, return need_clarification=false, an empty question, and a verification that
briefly restates what you understood and says research is starting."#
    )
}

pub fn transform_messages_into_research_topic_prompt(messages: &str, date: &str) -> String {
    format!(
        r#"You will be given the messages exchanged so far with a user. Turn them into one detailed,
concrete research brief that will guide the research that follows.

<Messages>
{messages}
</Messages>

Today's date is {date}.

Guidelines:
1. Include every preference and constraint the user stated, in the first person.
2. Dimensions the user did not specify stay open-ended; do not invent constraints.
3. Prefer primary and official sources; name them when the user implied them.
4. Match the language the user wrote in.

Respond in valid JSON with a single key "research_brief"."#
    )
}

pub fn research_outline_prompt(research_brief: &str, messages: &str, date: &str) -> String {
    format!(
        r#"Create a research outline for the following brief.

<Research Brief>
{research_brief}
</Research Brief>

<Context Messages>
{messages}
</Context Messages>

Today's date is {date}.

List the sub-topics that need independent investigation, one heading per sub-topic, each with
two or three concrete search queries. Note which sub-topics can be researched in parallel.
Return the outline as markdown."#
    )
}

pub fn lead_researcher_prompt(date: &str, max_concurrent_units: usize, max_iterations: u32) -> String {
    format!(
        r#"You are a research supervisor. Your job is to conduct research by calling the
"ConductResearch" tool. For context, today's date is {date}.

<Task>
Delegate focused sub-topics of the research brief to sub-agents with "ConductResearch".
When the findings returned fully answer the brief, call "ResearchComplete".
</Task>

<Available Tools>
1. ConductResearch: delegate one self-contained research topic to a sub-agent.
2. ResearchComplete: signal that research is finished.
3. think_tool: reflect on progress and plan the next step.

Use think_tool before calling ConductResearch to plan, and after each batch of results to
assess what is still missing. Do not call think_tool in parallel with other tools.
</Available Tools>

<Hard Limits>
- Use at most {max_concurrent_units} parallel ConductResearch calls per turn.
- Stop after {max_iterations} rounds of delegation even if gaps remain.
- Bias towards a single sub-agent unless the brief clearly splits into independent parts.
</Hard Limits>

<Delegation>
Each ConductResearch topic must stand alone: sub-agents cannot see the brief or each other's
work. Spell out acronyms and give full context in every topic.
</Delegation>"#
    )
}

pub fn research_system_prompt(mcp_prompt: Option<&str>, date: &str) -> String {
    let mcp_prompt = mcp_prompt.unwrap_or_default();
    format!(
        r#"You are a research assistant investigating the topic given by the user. For context,
today's date is {date}.

<Task>
Use the tools available to gather information that answers the research topic. Call tools
in series or in parallel; work in a tool-calling loop.
</Task>

<Available Tools>
1. web_search (when available): search the web for information.
2. think_tool: reflect after each search on what you found and what is still missing.
{mcp_prompt}
</Available Tools>

<Hard Limits>
- Simple questions: at most 2-3 search calls. Complex questions: at most 5.
- Stop as soon as you can answer comprehensively, or when the last two searches returned
  nothing new.
- When finished, call ResearchComplete or simply stop calling tools.
</Hard Limits>"#
    )
}

pub fn compress_research_system_prompt(date: &str) -> String {
    format!(
        r#"You are a research assistant that has gathered information on a topic through several
tool calls and web searches. Your job is now to clean up the findings while preserving every
relevant statement and piece of information. For context, today's date is {date}.

<Guidelines>
1. Keep all relevant information verbatim; only remove obvious duplicates and irrelevant text.
2. Include every source the researcher found, with inline citations like [1].
3. Number sources sequentially without gaps; each distinct URL gets exactly one number.
</Guidelines>

<Output Format>
**List of Queries and Tool Calls Made**
**Fully Comprehensive Findings**
**List of All Relevant Sources (with citations in the report)**
</Output Format>

<Citation Rules>
- End with a `### Sources` section listing each source as `[n] Title: URL`.
</Citation Rules>"#
    )
}

pub fn compress_research_human_message() -> String {
    "All above messages are about research conducted by an AI researcher. Please clean up these \
     findings.\n\nDO NOT summarize the information. Return the raw information in a cleaner \
     format, and keep every relevant source."
        .to_string()
}

pub fn final_report_generation_prompt(
    research_brief: &str,
    research_outline: &str,
    messages: &str,
    findings: &str,
    date: &str,
) -> String {
    format!(
        r#"Based on all the research conducted, write a comprehensive, well-structured answer to
the overall research brief.

<Research Brief>
{research_brief}
</Research Brief>

<Research Outline>
{research_outline}
</Research Outline>

<Messages>
{messages}
</Messages>

Today's date is {date}.

<Findings>
{findings}
</Findings>

Guidelines:
- Use markdown headings (# title, ## sections) and write in paragraphs.
- Write in the same language as the user's messages.
- Cite sources inline as [1], [2]; each distinct URL gets one number, assigned sequentially.
- End with a `### Sources` section listing `[n] Title: URL`, one per line."#
    )
}

pub fn summarize_webpage_prompt(webpage_content: &str, date: &str) -> String {
    format!(
        r#"You are tasked with summarizing the raw content of a webpage retrieved from a web
search. Preserve the most important information, key facts, figures and quotes.

<webpage_content>
{webpage_content}
</webpage_content>

Today's date is {date}.

Respond in valid JSON with two keys:
"summary": a concise summary of the main points, roughly a quarter of the original length,
"key_excerpts": up to five verbatim quotes, as a single string."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn today_is_rendered_with_short_names() {
        let today = today_str();
        let parts: Vec<&str> = today.split(' ').collect();
        assert_eq!(parts.len(), 4);
        assert!(parts[2].ends_with(','));
    }

    #[test]
    fn truncation_counts_characters() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 50), "short");
    }

    #[test]
    fn lead_prompt_states_the_caps() {
        let prompt = lead_researcher_prompt("Mon Jan 1, 2024", 3, 6);
        assert!(prompt.contains("at most 3 parallel"));
        assert!(prompt.contains("after 6 rounds"));
    }

    #[test]
    fn report_prompts_ask_for_a_sources_section() {
        let compress = compress_research_system_prompt("Mon Jan 1, 2024");
        assert!(compress.contains("`### Sources`"));
        assert!(compress.ends_with("</Citation Rules>"));

        let report = final_report_generation_prompt("brief", "outline", "msgs", "notes", "today");
        assert!(report.contains("<Findings>\nnotes\n</Findings>"));
        assert!(report.ends_with("`[n] Title: URL`, one per line."));
    }
}
