use alloy::sol;

sol! {
    /// ERC-721 layout: all three parameters are indexed, so the log carries
    /// four topics and an empty data section.
    event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);

    #[sol(rpc)]
    interface IDomainRegistry {
        function getDomainByTokenId(uint256 tokenId) external view returns (string);
    }
}
