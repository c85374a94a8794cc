//! Prompt composition for the regulatory assistant.
//!
//! The composer emits four labeled sections in a fixed order so the final
//! prompt is deterministic and testable: system instructions, the verbatim
//! user question, the category label, and the retrieved context. Empty
//! sections are never dropped silently; they carry an explicit marker.

/// Default specialist instructions for the assistant.
pub const DEFAULT_SYSTEM_INSTRUCTIONS: &str = "\
Eres un especialista en compras públicas y normativa de abastecimiento del Estado Peruano. \
Tu tarea es responder consultas técnicas basándote en la normativa vigente.

INSTRUCCIONES ESPECÍFICAS:
1. Proporciona respuestas claras, precisas y técnicamente correctas
2. Cita específicamente los artículos o secciones normativas relevantes
3. Si la normativa disponible no cubre completamente la consulta, indícalo claramente
4. Usa un lenguaje profesional pero accesible para especialistas en abastecimiento
5. Estructura tu respuesta con puntos claros cuando sea apropiado
6. Si hay procedimientos específicos, detállalos paso a paso
7. Siempre menciona la fuente normativa específica (Ley, Reglamento, Directiva)
8. Si necesitas información adicional, sugiere dónde buscarla";

/// Category label used when the query carries no category.
pub const GENERAL_CATEGORY_MARKER: &str = "General";

/// Context-section marker used when retrieval produced no text.
pub const NO_CONTEXT_MARKER: &str = "No hay normativa disponible para esta consulta.";

/// Composer configuration. Loaded once at startup and passed explicitly into
/// every composition call; never read through ambient/global state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposerConfig {
    pub system_instructions: String,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self { system_instructions: DEFAULT_SYSTEM_INSTRUCTIONS.to_string() }
    }
}

/// Build the final prompt. `context` is expected to already respect the
/// caller's size budget; no truncation happens here.
#[must_use]
pub fn compose_prompt(
    config: &ComposerConfig,
    context: &str,
    category: Option<&str>,
    question: &str,
) -> String {
    let category_label = match category {
        Some(name) if !name.trim().is_empty() => name,
        _ => GENERAL_CATEGORY_MARKER,
    };
    let context_block = if context.is_empty() { NO_CONTEXT_MARKER } else { context };

    format!(
        "{instructions}\n\n\
         CONSULTA DEL USUARIO:\n\"{question}\"\n\n\
         CATEGORÍA: {category_label}\n\n\
         NORMATIVA RELEVANTE DISPONIBLE:\n{context_block}\n\n\
         RESPUESTA:",
        instructions = config.system_instructions,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_four_sections_are_present_in_order() {
        let prompt = compose_prompt(
            &ComposerConfig::default(),
            "Artículo 1.- Objeto de la Ley...",
            Some("Licitaciones"),
            "¿Cuáles son los plazos para una licitación pública?",
        );

        let instructions = prompt
            .find("especialista en compras públicas")
            .unwrap_or_else(|| panic!("missing instructions section: {prompt}"));
        let question = prompt
            .find("CONSULTA DEL USUARIO:")
            .unwrap_or_else(|| panic!("missing question section: {prompt}"));
        let category = prompt
            .find("CATEGORÍA: Licitaciones")
            .unwrap_or_else(|| panic!("missing category section: {prompt}"));
        let context = prompt
            .find("NORMATIVA RELEVANTE DISPONIBLE:")
            .unwrap_or_else(|| panic!("missing context section: {prompt}"));

        assert!(instructions < question && question < category && context > category);
        assert!(prompt.ends_with("RESPUESTA:"));
    }

    #[test]
    fn question_is_included_verbatim() {
        let question = "  ¿Qué PASA con los   Consorcios? ";
        let prompt = compose_prompt(&ComposerConfig::default(), "ctx", None, question);
        assert!(prompt.contains(&format!("\"{question}\"")));
    }

    #[test]
    fn missing_category_uses_the_general_marker() {
        let prompt = compose_prompt(&ComposerConfig::default(), "ctx", None, "pregunta");
        assert!(prompt.contains("CATEGORÍA: General"));

        let blank = compose_prompt(&ComposerConfig::default(), "ctx", Some("   "), "pregunta");
        assert!(blank.contains("CATEGORÍA: General"));
    }

    #[test]
    fn empty_context_uses_the_explicit_marker() {
        let prompt = compose_prompt(&ComposerConfig::default(), "", None, "pregunta");
        assert!(prompt.contains(NO_CONTEXT_MARKER));
    }

    #[test]
    fn custom_instructions_replace_the_default() {
        let config =
            ComposerConfig { system_instructions: "Responde en una sola frase.".to_string() };
        let prompt = compose_prompt(&config, "ctx", None, "pregunta");
        assert!(prompt.starts_with("Responde en una sola frase."));
        assert!(!prompt.contains("especialista en compras públicas"));
    }
}
