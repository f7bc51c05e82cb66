use super::{
    anthropic::AnthropicProvider, base::Provider, configs::ProviderConfig, google::GoogleProvider,
    openai::OpenAiProvider, xai::XaiProvider,
};
use anyhow::Result;

pub fn get_provider(config: ProviderConfig) -> Result<Box<dyn Provider>> {
    match config {
        ProviderConfig::Anthropic(anthropic_config) => {
            Ok(Box::new(AnthropicProvider::new(anthropic_config)?))
        }
        ProviderConfig::OpenAi(openai_config) => Ok(Box::new(OpenAiProvider::new(openai_config)?)),
        ProviderConfig::Xai(xai_config) => Ok(Box::new(XaiProvider::new(xai_config)?)),
        ProviderConfig::Google(google_config) => Ok(Box::new(GoogleProvider::new(google_config)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::base::ProviderKind;
    use crate::providers::configs::ApiKeys;

    #[test]
    fn test_provider_selected_by_model_name() -> Result<()> {
        let keys = ApiKeys::default().with_key(ProviderKind::Google, "g".into());
        for (model, kind) in [
            ("claude-3-5-haiku-latest", ProviderKind::Anthropic),
            ("gpt-4.1", ProviderKind::OpenAi),
            ("grok-4", ProviderKind::Xai),
            ("gemini-2.5-pro", ProviderKind::Google),
        ] {
            let provider = get_provider(ProviderConfig::for_model(model, &keys)?)?;
            assert_eq!(provider.kind(), kind);
            assert_eq!(provider.model(), model);
        }
        assert!(ProviderConfig::for_model("llama-3", &keys).is_err());
        Ok(())
    }
}
