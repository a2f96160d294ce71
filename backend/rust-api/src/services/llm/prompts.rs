use serde_json::Value;
use std::fmt::Write as _;

use crate::models::assessment::{AssessmentContext, ChatContext, ChatMessage, ChatRole};
use crate::models::content::LevelType;
use crate::models::{EvaluationRequest, QuestionRequest, TestCase};

pub const BEGINNER_SYSTEM_PROMPT: &str = "\
You write and grade short JavaScript exercises for absolute beginners who \
have just been taught a topic by a live tutor. Only test the cumulative \
topics you are given. Easy questions use one concept in a few lines, medium \
ones combine two, hard ones combine two or three with multi-step logic. \
Never repeat a previous question pattern. Be encouraging and plain. \
Always answer with a single JSON object and nothing else.";

pub const TUTOR_SYSTEM_PROMPT: &str = "\
You are a patient programming tutor guiding a student through five levels \
per topic: syntax, multiple solution paths, debugging, working under \
constraints, and a small real project. Guide with questions before giving \
answers, point out what works before what does not, and never hand over a \
full solution. When asked to assess a submission, finish your reply with a \
```json block containing passed (boolean), feedback (string), \
creativityScore (0-50, only for multi-path, constraint and micro-project \
levels, otherwise 0), approachLabel (short name of the approach or null) and \
hintsUsed (number).";

const RECENT_CHAT_LIMIT: usize = 10;
const ASSESSMENT_TEST_CASE_LIMIT: usize = 5;

fn compact(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn push_test_cases<'a>(out: &mut String, cases: impl Iterator<Item = &'a TestCase>) {
    for (i, tc) in cases.enumerate() {
        let _ = writeln!(out, "{}. {}", i + 1, tc.description);
        let _ = writeln!(out, "   Input: {}", compact(&tc.input));
        let _ = writeln!(out, "   Expected: {}", compact(&tc.expected_output));
    }
}

fn push_code(out: &mut String, heading: &str, code: &str) {
    let _ = writeln!(out, "### {}", heading);
    out.push_str("```javascript\n");
    out.push_str(if code.is_empty() { "// (empty)" } else { code });
    out.push_str("\n```\n\n");
}

fn push_recent_chat(out: &mut String, history: &[ChatMessage]) {
    let start = history.len().saturating_sub(RECENT_CHAT_LIMIT);
    let recent = &history[start..];
    if recent.is_empty() {
        return;
    }
    out.push_str("### Recent Chat History\n");
    for message in recent {
        let label = match message.role {
            ChatRole::System => continue,
            ChatRole::User => "Student",
            ChatRole::Assistant => "AI Tutor",
        };
        let _ = writeln!(out, "**{}**: {}", label, message.content);
    }
    out.push('\n');
}

fn push_constraints(out: &mut String, constraints: &[String]) {
    if constraints.is_empty() {
        return;
    }
    out.push_str("### Constraints (Forbidden Syntax)\n");
    let _ = writeln!(out, "The student CANNOT use: {}\n", constraints.join(", "));
}

fn push_session_header(out: &mut String, ctx: &AssessmentContext) {
    out.push_str("## CURRENT SESSION CONTEXT\n\n");
    let _ = writeln!(out, "**Topic**: {}", ctx.topic);
    let _ = writeln!(out, "**Level**: {} ({})", ctx.level, ctx.level_type.as_str());
    let _ = writeln!(out, "**Problem**: {}", ctx.problem_title);
    let _ = writeln!(out, "**Problem Description**: {}", ctx.problem_description);
    let _ = writeln!(out, "**Attempt Number**: {}\n", ctx.attempt_number);
}

pub fn question_prompt(req: &QuestionRequest) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "## GENERATE QUESTION {} of {}\n",
        req.question_index + 1,
        req.total_questions
    );
    let _ = writeln!(out, "**Current Topic**: {} ({})", req.topic_title, req.topic_id);
    let _ = writeln!(
        out,
        "**Cumulative Topics**: {}",
        req.cumulative_topics.join(", ")
    );
    let _ = writeln!(out, "**Difficulty**: {}\n", req.difficulty.as_str());

    if !req.previous_questions.is_empty() {
        out.push_str("### Previous Questions (avoid repeating similar patterns)\n");
        for (i, q) in req.previous_questions.iter().enumerate() {
            let _ = writeln!(out, "{}. \"{}\" (fn: {})", i + 1, q.prompt, q.function_name);
        }
        out.push('\n');
    }

    let _ = write!(
        out,
        "Generate a {} difficulty JavaScript coding question that tests the cumulative topics \
         listed above. Respond with ONLY the JSON object. The JSON must have these fields: \
         question, functionName, testCases (array of {{id, description, input, expectedOutput, \
         isHidden}}), hint, difficulty, topicsTested.",
        req.difficulty.as_str()
    );
    out
}

pub fn evaluation_prompt(req: &EvaluationRequest) -> String {
    let mut out = String::from("## EVALUATE STUDENT CODE\n\n");
    let _ = writeln!(out, "**Question**: {}", req.question);
    let _ = writeln!(out, "**Function Name**: {}", req.function_name);
    let _ = writeln!(out, "**Attempt**: {}\n", req.attempt_number);

    out.push_str("### Test Cases\n");
    push_test_cases(&mut out, req.test_cases.iter());
    out.push('\n');

    push_code(&mut out, "Student's Code", &req.student_code);

    out.push_str(
        "Evaluate the student's code against the test cases. Respond with ONLY the JSON object. \
         The JSON must have these fields: passed (boolean), feedback (string), failedTests \
         (array of strings), correctCount (number), totalTests (number).",
    );
    out
}

pub fn assessment_prompt(ctx: &AssessmentContext) -> String {
    let mut out = String::new();
    push_session_header(&mut out, ctx);

    if !ctx.test_cases.is_empty() {
        out.push_str("### Test Cases\n");
        push_test_cases(
            &mut out,
            ctx.test_cases.iter().take(ASSESSMENT_TEST_CASE_LIMIT),
        );
        out.push('\n');
    }

    push_constraints(&mut out, &ctx.constraints);

    if ctx.level_type == LevelType::MultiPath {
        if let Some(required) = ctx.required_solutions {
            out.push_str("### Multi-Path Progress\n");
            let _ = writeln!(out, "Required unique solutions: {}", required);
            if ctx.submitted_solutions.is_empty() {
                out.push_str("No solutions submitted yet.\n");
            } else {
                out.push_str("Already submitted:\n");
                for solution in &ctx.submitted_solutions {
                    let _ = writeln!(
                        out,
                        "  Solution {} ({}):\n  ```js\n  {}\n  ```",
                        solution.solution_number, solution.approach, solution.code
                    );
                }
            }
            out.push('\n');
        }
    }

    push_code(&mut out, "Student's Current Code", &ctx.student_code);

    if !ctx.test_results.is_empty() {
        let passed = ctx.test_results.iter().filter(|r| r.passed).count();
        let _ = writeln!(
            out,
            "### Test Results ({}/{} passed)",
            passed,
            ctx.test_results.len()
        );
        for result in &ctx.test_results {
            let icon = if result.passed { "PASS" } else { "FAIL" };
            let _ = writeln!(out, "- [{}] {}", icon, result.description);
            if !result.passed {
                let _ = writeln!(out, "  Expected: {}", compact(&result.expected));
                let _ = writeln!(out, "  Actual: {}", compact(&result.actual));
                if let Some(error) = &result.error {
                    let _ = writeln!(out, "  Error: {}", error);
                }
            }
        }
        out.push('\n');
    }

    push_recent_chat(&mut out, &ctx.chat_history);

    let _ = write!(
        out,
        "---\n\nThe student has submitted their code for assessment. Assess it for Level {} \
         ({}) and finish with your verdict in a ```json code block.",
        ctx.level,
        ctx.level_type.as_str()
    );
    out
}

pub fn chat_prompt(ctx: &ChatContext) -> String {
    let assessment = &ctx.assessment;
    let mut out = String::new();
    push_session_header(&mut out, assessment);
    push_constraints(&mut out, &assessment.constraints);
    if !assessment.student_code.is_empty() {
        push_code(&mut out, "Student's Current Code", &assessment.student_code);
    }
    push_recent_chat(&mut out, &assessment.chat_history);

    out.push_str("### Student's New Message\n");
    out.push_str(&ctx.user_message);
    out.push_str(
        "\n\n---\n\nRespond to the student conversationally and concisely. Do NOT respond with \
         JSON.",
    );
    out
}
