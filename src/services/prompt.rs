//! 交互确认

use std::io::{BufRead, Write};

/// yes/no 确认
pub trait Prompt: Send + Sync {
    /// `default` 为 None 时必须明确回答
    fn confirm(&self, question: &str, default: Option<bool>) -> bool;
}

/// 从标准输入读取回答
pub struct StdinPrompt;

impl Prompt for StdinPrompt {
    fn confirm(&self, question: &str, default: Option<bool>) -> bool {
        let hint = match default {
            Some(true) => "[YES/no]",
            Some(false) => "[yes/NO]",
            None => "[yes/no]",
        };

        let stdin = std::io::stdin();
        loop {
            eprint!("{} {} ", question, hint);
            let _ = std::io::stderr().flush();

            let mut answer = String::new();
            match stdin.lock().read_line(&mut answer) {
                // EOF：没有默认值时按拒绝处理
                Ok(0) => return default.unwrap_or(false),
                Ok(_) => {}
                Err(_) => return default.unwrap_or(false),
            }

            match parse_answer(&answer) {
                Some(choice) => return choice,
                None if answer.trim().is_empty() => {
                    if let Some(choice) = default {
                        return choice;
                    }
                }
                None => {}
            }
        }
    }
}

fn parse_answer(answer: &str) -> Option<bool> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}
