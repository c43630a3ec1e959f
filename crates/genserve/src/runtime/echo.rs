use super::{GenerateParams, ModelRuntime, TokenSink, config_usize};
use crate::{Result, TokenId, TokenSequence, stop::StoppingCriteria};

/// Model id that selects [`EchoRuntime`].
pub const ECHO_MODEL: &str = "echo";

const DEFAULT_MAX_NEW_TOKENS: usize = 16;

/// Deterministic runtime that replays the prompt tokens cyclically.
///
/// Useful for exercising the serving pipeline without model weights.
/// Recognised options:
///
/// - `max_new_tokens` (default 16)
/// - `eos_after`: emit the end-of-sequence token after this many new tokens
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoRuntime;

impl ModelRuntime for EchoRuntime {
    fn generate(
        &mut self,
        input: &[TokenId],
        params: &GenerateParams,
        stop: &dyn StoppingCriteria,
        mut sink: Option<&mut dyn TokenSink>,
    ) -> Result<TokenSequence> {
        let max_new_tokens =
            config_usize(&params.config, "max_new_tokens")?.unwrap_or(DEFAULT_MAX_NEW_TOKENS);
        let eos_after = config_usize(&params.config, "eos_after")?;

        let mut tokens = input.to_vec();
        if let Some(sink) = sink.as_mut() {
            sink.put(input)?;
        }

        for step in 0..max_new_tokens {
            let next = if eos_after == Some(step) {
                match params.eos_token_id {
                    Some(eos) => eos,
                    None => break,
                }
            } else if input.is_empty() {
                break;
            } else {
                input[step % input.len()]
            };

            tokens.push(next);
            if let Some(sink) = sink.as_mut() {
                sink.put(&[next])?;
            }

            if Some(next) == params.eos_token_id || stop.should_stop(&tokens) {
                break;
            }
        }

        if let Some(sink) = sink.as_mut() {
            sink.end()?;
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stop::StopCondition;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        puts: Vec<Vec<TokenId>>,
        ended: bool,
    }

    impl TokenSink for Recorder {
        fn put(&mut self, tokens: &[TokenId]) -> Result<()> {
            self.puts.push(tokens.to_vec());
            Ok(())
        }

        fn end(&mut self) -> Result<()> {
            self.ended = true;
            Ok(())
        }
    }

    fn params(config: serde_json::Value) -> GenerateParams {
        GenerateParams {
            pad_token_id: Some(99),
            eos_token_id: Some(99),
            config: config.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn replays_prompt_up_to_max_new_tokens() {
        let out = EchoRuntime
            .generate(
                &[1, 2],
                &params(json!({ "max_new_tokens": 5 })),
                &StopCondition::default(),
                None,
            )
            .unwrap();
        assert_eq!(out, vec![1, 2, 1, 2, 1, 2, 1]);
    }

    #[test]
    fn halts_on_stop_sequence() {
        let stop = StopCondition::new(vec![vec![3, 1]]);
        let out = EchoRuntime
            .generate(&[1, 2, 3], &params(json!({})), &stop, None)
            .unwrap();
        // The tail spans the prompt and the first generated token.
        assert_eq!(out, vec![1, 2, 3, 1]);
        assert!(stop.matches(&out));
    }

    #[test]
    fn emits_eos_when_asked() {
        let out = EchoRuntime
            .generate(
                &[5],
                &params(json!({ "eos_after": 2 })),
                &StopCondition::default(),
                None,
            )
            .unwrap();
        assert_eq!(out, vec![5, 5, 5, 99]);
    }

    #[test]
    fn streams_prompt_then_each_token_then_end() {
        let mut recorder = Recorder::default();
        EchoRuntime
            .generate(
                &[7, 8],
                &params(json!({ "max_new_tokens": 2 })),
                &StopCondition::default(),
                Some(&mut recorder),
            )
            .unwrap();
        assert_eq!(recorder.puts, vec![vec![7, 8], vec![7], vec![8]]);
        assert!(recorder.ended);
    }

    #[test]
    fn rejects_invalid_config() {
        let err = EchoRuntime
            .generate(
                &[1],
                &params(json!({ "max_new_tokens": "many" })),
                &StopCondition::default(),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, crate::Error::Generation { .. }));
    }
}
