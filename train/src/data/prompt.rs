use super::{Prompts, SampleRecord};
use crate::common::*;

/// Which prompt type to draw sentences from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PromptType {
    /// Pick a type uniformly among the types of each record.
    Random,
    Named(String),
}

impl Serialize for PromptType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Random => serializer.serialize_str("random"),
            Self::Named(name) => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for PromptType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        match text.as_str() {
            "random" => Ok(Self::Random),
            "" => Err(D::Error::custom("prompt type must not be empty")),
            _ => Ok(Self::Named(text)),
        }
    }
}

/// Selects the sentence list of one prompt type of the record.
pub fn select_sentences<'a, R>(
    record: &'a SampleRecord,
    prompt_type: &PromptType,
    rng: &mut R,
) -> Result<Vec<&'a str>>
where
    R: Rng + ?Sized,
{
    let prompts: &Prompts = match prompt_type {
        PromptType::Random => {
            let index = rng.gen_range(0..record.prompts.len().max(1));
            let (_, prompts) = record
                .prompts
                .get_index(index)
                .ok_or_else(|| format_err!("the record '{}' has no prompts", record.mask_name))?;
            prompts
        }
        PromptType::Named(name) => record.prompts.get(name).ok_or_else(|| {
            format_err!(
                "the record '{}' has no prompt type '{}'",
                record.mask_name,
                name
            )
        })?,
    };
    Ok(prompts.sentences())
}

/// Chooses one sentence uniformly.
pub fn choose_sentence<'a, R>(sentences: &[&'a str], rng: &mut R) -> Result<&'a str>
where
    R: Rng + ?Sized,
{
    sentences
        .choose(rng)
        .copied()
        .ok_or_else(|| format_err!("empty sentence list"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SampleRecord {
        let mut prompts = IndexMap::new();
        prompts.insert(
            "sentence".to_string(),
            Prompts::Many(vec!["the left dog".into(), "a brown dog".into()]),
        );
        prompts.insert("phrase".to_string(), Prompts::One("dog".into()));
        prompts.insert("empty".to_string(), Prompts::Many(vec![]));
        SampleRecord {
            image_bytes: vec![],
            mask_bytes: None,
            mask_name: "0.png".into(),
            prompts,
        }
    }

    #[test]
    fn named_prompt_type() -> Result<()> {
        let record = record();
        let mut rng = StdRng::seed_from_u64(1);
        let sentences = select_sentences(&record, &PromptType::Named("phrase".into()), &mut rng)?;
        assert_eq!(sentences, vec!["dog"]);
        let sentences = select_sentences(&record, &PromptType::Named("empty".into()), &mut rng)?;
        assert_eq!(sentences, vec![""]);
        assert!(select_sentences(&record, &PromptType::Named("missing".into()), &mut rng).is_err());
        Ok(())
    }

    #[test]
    fn seeded_selection_is_reproducible() -> Result<()> {
        let record = record();
        let draw = |seed| -> Result<Vec<String>> {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..20)
                .map(|_| {
                    let sentences = select_sentences(&record, &PromptType::Random, &mut rng)?;
                    Ok(choose_sentence(&sentences, &mut rng)?.to_string())
                })
                .collect()
        };
        assert_eq!(draw(42)?, draw(42)?);
        Ok(())
    }

    #[test]
    fn random_type_covers_all_types() -> Result<()> {
        let record = record();
        let mut rng = StdRng::seed_from_u64(3);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let sentences = select_sentences(&record, &PromptType::Random, &mut rng)?;
            seen.insert(choose_sentence(&sentences, &mut rng)?);
        }
        assert_eq!(seen.len(), 4);
        Ok(())
    }

    #[test]
    fn parse_prompt_type() -> Result<()> {
        assert_eq!(serde_json::from_str::<PromptType>("\"random\"")?, PromptType::Random);
        assert_eq!(
            serde_json::from_str::<PromptType>("\"p7\"")?,
            PromptType::Named("p7".into())
        );
        assert!(serde_json::from_str::<PromptType>("\"\"").is_err());
        Ok(())
    }
}
