//! Prompt-injection detection.
//!
//! Seven attack classes, each backed by a small set of patterns with a fixed
//! confidence. The overall risk score is the weighted mean of the detected
//! classes' confidences — exfiltration and jailbreak weigh double, override
//! and prompt-leak 1.5× — clamped to [0, 1].

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionClass {
    SystemPromptLeak,
    RoleManipulation,
    InstructionOverride,
    DataExfiltration,
    Jailbreak,
    DelimiterAttack,
    EncodingAttack,
}

impl InjectionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            InjectionClass::SystemPromptLeak => "system_prompt_leak",
            InjectionClass::RoleManipulation => "role_manipulation",
            InjectionClass::InstructionOverride => "instruction_override",
            InjectionClass::DataExfiltration => "data_exfiltration",
            InjectionClass::Jailbreak => "jailbreak",
            InjectionClass::DelimiterAttack => "delimiter_attack",
            InjectionClass::EncodingAttack => "encoding_attack",
        }
    }

    /// Class weight in the risk-score mean.
    pub fn weight(&self) -> f64 {
        match self {
            InjectionClass::DataExfiltration | InjectionClass::Jailbreak => 2.0,
            InjectionClass::InstructionOverride | InjectionClass::SystemPromptLeak => 1.5,
            _ => 1.0,
        }
    }
}

struct InjectionPattern {
    class: InjectionClass,
    confidence: f64,
    regex: &'static Lazy<Regex>,
}

static INSTRUCTION_OVERRIDE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:ignore|disregard|forget|override)\s+(?:all\s+|any\s+)?(?:previous|prior|above|earlier|your)\s+(?:instructions?|rules?|guidelines?|prompts?|training)")
        .unwrap()
});

static SYSTEM_PROMPT_LEAK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:reveal|show|print|display|repeat|output|leak)\s+(?:me\s+)?(?:your|the)\s+(?:full\s+|hidden\s+|secret\s+|initial\s+)?(?:system\s+prompt|instructions)|(?i)what\s+(?:are|were)\s+your\s+(?:original\s+|initial\s+)?instructions")
        .unwrap()
});

static ROLE_MANIPULATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\byou\s+are\s+now\s+(?:a|an|the)\b|(?i)\bact\s+as\s+(?:if\s+you|an?\s+(?:unrestricted|unfiltered|uncensored))|(?i)\bpretend\s+(?:to\s+be|you\s+are)\b|(?i)\bfrom\s+now\s+on\s+(?:you\s+are|respond\s+as|act\s+as)")
        .unwrap()
});

static DATA_EXFILTRATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:send|post|upload|exfiltrate|forward|transmit)\s+(?:all\s+)?(?:your|the|this|my)\s+(?:data|conversation|chat|history|secrets?|credentials?|keys?)\s+to\b|(?i)\bfetch\s+https?://\S+\s+(?:with|and\s+send)")
        .unwrap()
});

static JAILBREAK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bDAN\b.{0,40}\bmode\b|(?i)\bjailbr(?:eak|oken)\b|(?i)\bdeveloper\s+mode\b|(?i)\bwithout\s+(?:any\s+)?(?:restrictions?|filters?|limitations?|censorship)\b")
        .unwrap()
});

static DELIMITER_ATTACK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<\|?(?:im_start|im_end|system|endoftext)\|?>|\[/?INST\]|(?i)<<\s*/?SYS\s*>>|```\s*system")
        .unwrap()
});

static ENCODING_ATTACK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bbase64\s+(?:decode|encoded?)\b|(?i)\brot13\b|(?i)\bhex\s+decode\b|(?i)\bdecode\s+(?:this|the\s+following)\b")
        .unwrap()
});

static PATTERNS: &[InjectionPattern] = &[
    InjectionPattern { class: InjectionClass::InstructionOverride, confidence: 0.90, regex: &INSTRUCTION_OVERRIDE_RE },
    InjectionPattern { class: InjectionClass::SystemPromptLeak, confidence: 0.85, regex: &SYSTEM_PROMPT_LEAK_RE },
    InjectionPattern { class: InjectionClass::RoleManipulation, confidence: 0.75, regex: &ROLE_MANIPULATION_RE },
    InjectionPattern { class: InjectionClass::DataExfiltration, confidence: 0.85, regex: &DATA_EXFILTRATION_RE },
    InjectionPattern { class: InjectionClass::Jailbreak, confidence: 0.90, regex: &JAILBREAK_RE },
    InjectionPattern { class: InjectionClass::DelimiterAttack, confidence: 0.80, regex: &DELIMITER_ATTACK_RE },
    InjectionPattern { class: InjectionClass::EncodingAttack, confidence: 0.80, regex: &ENCODING_ATTACK_RE },
];

#[derive(Debug, Clone, PartialEq)]
pub struct InjectionDetection {
    pub class: InjectionClass,
    pub confidence: f64,
    pub matched: String,
}

#[derive(Debug, Clone, Default)]
pub struct InjectionReport {
    pub detections: Vec<InjectionDetection>,
    pub risk_score: f64,
}

/// Analyze `text` for injection markers; at most one detection per class.
pub fn analyze(text: &str) -> InjectionReport {
    let mut detections = Vec::new();
    for pattern in PATTERNS {
        if let Some(m) = pattern.regex.find(text) {
            detections.push(InjectionDetection {
                class: pattern.class,
                confidence: pattern.confidence,
                matched: m.as_str().to_string(),
            });
        }
    }

    let risk_score = if detections.is_empty() {
        0.0
    } else {
        let weighted: f64 = detections.iter().map(|d| d.confidence * d.class.weight()).sum();
        let total: f64 = detections.iter().map(|d| d.class.weight()).sum();
        (weighted / total).min(1.0)
    };

    InjectionReport { detections, risk_score }
}
